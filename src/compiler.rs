//! Compiler service boundary.
//!
//! The compiler front-end itself (lexing, parsing, codegen) is an external
//! collaborator behind the [`CompilerService`] trait. The host only looks at
//! the diagnostics, the declared external references, and the module
//! manifest that the compiler emits alongside the payload.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Attribute key the compiler attaches to event-handler methods.
///
/// The value is the logical event name the method handles. An explicit
/// metadata map stands in for language-native attributes so the registry
/// never depends on runtime reflection.
pub const EVENT_ATTRIBUTE: &str = "event";

/// One source file going into a compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path the file was read from (used in diagnostics).
    pub path: PathBuf,
    /// Full text of the file.
    pub text: String,
}

/// An ordered, deduplicated set of sources plus a language-version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileUnit {
    /// Sources, sorted by path with duplicates removed.
    pub sources: Vec<SourceFile>,
    /// Target language version, passed through to the compiler untouched.
    pub language_version: String,
}

impl CompileUnit {
    /// Build a unit from arbitrary sources, sorting by path and dropping
    /// duplicate paths (first occurrence wins).
    pub fn new(mut sources: Vec<SourceFile>, language_version: impl Into<String>) -> Self {
        sources.sort_by(|a, b| a.path.cmp(&b.path));
        sources.dedup_by(|a, b| a.path == b.path);
        Self {
            sources,
            language_version: language_version.into(),
        }
    }
}

/// A single compiler message with its source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Human-readable message.
    pub message: String,
    /// Source location, e.g. `main.cs:12:4`.
    pub location: String,
}

/// Errors and warnings from one compile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Hard errors. Non-empty means the compile failed.
    pub errors: Vec<Diagnostic>,
    /// Warnings. May be present on success and failure alike.
    pub warnings: Vec<Diagnostic>,
}

/// Metadata for one compiled method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Method name within its type.
    pub name: String,
    /// Whether the method is invocable without an instance.
    pub is_static: bool,
    /// Declarative annotations the addon author attached to the method,
    /// emitted by the compiler as a plain key/value map.
    pub attributes: BTreeMap<String, String>,
}

impl MethodInfo {
    /// The event name this method handles, if it carries a non-empty
    /// event tag.
    pub fn event_tag(&self) -> Option<&str> {
        self.attributes
            .get(EVENT_ATTRIBUTE)
            .map(String::as_str)
            .filter(|tag| !tag.is_empty())
    }
}

/// Metadata for one compiled type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    /// Fully qualified type name.
    pub name: String,
    /// Methods declared on the type.
    pub methods: Vec<MethodInfo>,
}

/// Structural description of a compiled module, emitted by the compiler
/// alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleManifest {
    /// Every type in the module, in compiler emission order.
    pub types: Vec<TypeInfo>,
}

/// Output of one compile: opaque payload plus structured metadata.
///
/// Produced fresh on every compile and never mutated; each recompile
/// supersedes (never merges with) the previous result.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    /// Opaque executable payload. Only the execution context interprets it.
    pub payload: Vec<u8>,
    /// Errors and warnings from the compile.
    pub diagnostics: Diagnostics,
    /// Types and methods in the module, with their attribute maps.
    pub manifest: ModuleManifest,
    /// External modules/capabilities the compiled code touches.
    /// `None` means the compiler could not fully enumerate them, which the
    /// security audit treats as a denial.
    pub external_refs: Option<Vec<String>>,
}

impl CompiledModule {
    /// Whether the compile succeeded (no hard errors).
    pub fn is_success(&self) -> bool {
        self.diagnostics.errors.is_empty()
    }
}

/// The external compiler service.
///
/// Implementations must be deterministic with respect to their inputs and
/// bounded in time; the lifecycle manager runs `compile` on a blocking
/// thread under a timeout.
pub trait CompilerService: Send + Sync + 'static {
    /// Compile a source set into a module. Failure is expressed as a
    /// module whose diagnostics carry a non-empty error list.
    fn compile(&self, unit: &CompileUnit) -> CompiledModule;
}

/// Enumerate an addon source directory into a [`CompileUnit`].
///
/// Walks the directory recursively and reads every regular file, sorted by
/// path for deterministic compiles. Symlinks are skipped.
pub fn collect_sources(
    dir: &Path,
    language_version: &str,
) -> std::io::Result<CompileUnit> {
    let mut sources = Vec::new();
    collect_into(dir, &mut sources)?;
    Ok(CompileUnit::new(sources, language_version))
}

fn collect_into(dir: &Path, sources: &mut Vec<SourceFile>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();

        // Skip symlinks entirely. Author-controlled trees can contain loops.
        if file_type.is_symlink() {
            continue;
        }

        if file_type.is_dir() {
            collect_into(&path, sources)?;
        } else if file_type.is_file() {
            let text = std::fs::read_to_string(&path)?;
            sources.push(SourceFile { path, text });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn src(path: &str, text: &str) -> SourceFile {
        SourceFile {
            path: PathBuf::from(path),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_compile_unit_sorts_and_dedups() {
        let unit = CompileUnit::new(
            vec![src("b.cs", "two"), src("a.cs", "one"), src("b.cs", "dup")],
            "latest",
        );

        assert_eq!(unit.sources.len(), 2);
        assert_eq!(unit.sources[0].path, PathBuf::from("a.cs"));
        assert_eq!(unit.sources[1].path, PathBuf::from("b.cs"));
    }

    #[test]
    fn test_event_tag_requires_nonempty_value() {
        let mut attributes = BTreeMap::new();
        attributes.insert(EVENT_ATTRIBUTE.to_string(), String::new());
        let method = MethodInfo {
            name: "Handler".to_string(),
            is_static: true,
            attributes,
        };
        assert_eq!(method.event_tag(), None);
    }

    #[test]
    fn test_event_tag_present() {
        let mut attributes = BTreeMap::new();
        attributes.insert(EVENT_ATTRIBUTE.to_string(), "tick".to_string());
        let method = MethodInfo {
            name: "OnTick".to_string(),
            is_static: true,
            attributes,
        };
        assert_eq!(method.event_tag(), Some("tick"));
    }

    #[test]
    fn test_collect_sources_recursive_and_sorted() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(dir.path().join("z.cs"), "last").unwrap();
        std::fs::write(nested.join("a.cs"), "first").unwrap();

        let unit = collect_sources(dir.path(), "latest").unwrap();
        assert_eq!(unit.sources.len(), 2);
        assert!(unit.sources[0].path.ends_with("nested/a.cs"));
        assert!(unit.sources[1].path.ends_with("z.cs"));
    }

    #[test]
    fn test_collect_sources_missing_dir_errors() {
        let result = collect_sources(Path::new("/nonexistent/src"), "latest");
        assert!(result.is_err());
    }
}
