//! The up-to-date evaluator (C8): decides whether a compiled artifact still matches its
//! inputs, so the scheduler can short-circuit a request instead of handing it to a worker.
//!
//! Every step below follows §4.7 in order; the first one that can't be satisfied wins.

use std::path::Path;

use crate::{
    header::ResourceHeader,
    id::ResourceId,
    record::{CompiledResourceRecord, RecordStore},
    registry::{CompilerDescriptor, CompilerInvocation},
};

/// Outcome of [`evaluate`]. `NeedsCompile` carries a human-readable reason so the caller can
/// fold it into the request's log at `trace`/`debug` level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpToDateDecision {
    UpToDate,
    NeedsCompile(String),
}

impl UpToDateDecision {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, UpToDateDecision::UpToDate)
    }
}

/// Runs the §4.7 procedure for `resource_id`, whose source lives at `source_path` and whose
/// compiled artifact would live at `compiled_path`.
pub fn evaluate(
    resource_id: &ResourceId,
    source_path: &Path,
    compiled_path: &Path,
    compiler: &dyn CompilerDescriptor,
    records: &RecordStore,
) -> UpToDateDecision {
    use UpToDateDecision::{NeedsCompile, UpToDate};

    if !compiled_path.is_file() {
        return NeedsCompile("no compiled artifact on disk".to_string());
    }

    let header = match ResourceHeader::read_from_file(compiled_path) {
        Ok(header) => header,
        Err(error) => return NeedsCompile(format!("failed to read compiled header: {error}")),
    };

    if header.compiler_version != compiler.version() {
        return NeedsCompile(format!(
            "compiler version mismatch (artifact has {}, registry has {})",
            header.compiler_version,
            compiler.version()
        ));
    }

    let record = match records.get(resource_id) {
        Some(record) => record,
        None => return NeedsCompile("no record store entry".to_string()),
    };

    let invocation = compile_dependency_invocation(resource_id, source_path, compiled_path, compiler);
    let compile_deps = match compiler.enumerate_compile_dependencies(&invocation) {
        Ok(deps) => deps,
        Err(error) => {
            return NeedsCompile(format!("could not enumerate compile-dependencies: {error}"))
        }
    };

    let current_hash = match source_timestamp_hash(source_path, &compile_deps) {
        Ok(hash) => hash,
        Err(error) => return NeedsCompile(format!("could not hash source timestamps: {error}")),
    };

    if current_hash != record.source_timestamp_hash {
        return NeedsCompile("source or compile-dependency timestamps changed".to_string());
    }

    UpToDate
}

/// Deterministic 64-bit hash over the source file's modified-time and each compile
/// dependency's modified-time, in the order given. A missing file (source or dependency)
/// makes the resource un-compileable right now; the caller treats that as `NeedsCompile`
/// and lets the real compile attempt produce the authoritative error (§9).
pub fn source_timestamp_hash(
    source_path: &Path,
    compile_dependencies: &[std::path::PathBuf],
) -> std::io::Result<u64> {
    let mut hasher = blake3::Hasher::new();
    hash_mtime(&mut hasher, source_path)?;
    for dep in compile_dependencies {
        hash_mtime(&mut hasher, dep)?;
    }
    let digest = hasher.finalize();
    let bytes: [u8; 8] = digest.as_bytes()[..8].try_into().expect("8 bytes from a 32-byte hash");
    Ok(u64::from_le_bytes(bytes))
}

fn hash_mtime(hasher: &mut blake3::Hasher, path: &Path) -> std::io::Result<()> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata.modified()?;
    let nanos = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    hasher.update(&nanos.to_le_bytes());
    Ok(())
}

/// The `-info -query=compile-deps` invocation for `resource_id`, carrying its real
/// [`crate::id::ResourceTypeId`] rather than a guess — this is what a compiler handling
/// several resource types needs to tell which one it is being asked about (§6's `-type=<4cc>`
/// contract).
fn compile_dependency_invocation(
    resource_id: &ResourceId,
    source_path: &Path,
    compiled_path: &Path,
    compiler: &dyn CompilerDescriptor,
) -> CompilerInvocation {
    CompilerInvocation {
        resource_type: resource_id.resource_type(),
        input_path: compiler.requires_input_file().then(|| source_path.to_path_buf()),
        output_path: compiled_path.to_path_buf(),
        force: false,
        platform: None,
    }
}

/// Builds the record this evaluator would consider up-to-date for the given inputs, for use
/// by the scheduler when it writes a fresh record after a successful compile.
pub fn record_for(
    compiler: &dyn CompilerDescriptor,
    resource_id: &ResourceId,
    source_path: &Path,
    compiled_path: &Path,
    install_dependencies: Vec<ResourceId>,
) -> std::io::Result<CompiledResourceRecord> {
    let invocation = compile_dependency_invocation(resource_id, source_path, compiled_path, compiler);
    let compile_deps = compiler.enumerate_compile_dependencies(&invocation).unwrap_or_default();
    let hash = source_timestamp_hash(source_path, &compile_deps)?;
    Ok(CompiledResourceRecord {
        compiler_version: compiler.version(),
        source_timestamp_hash: hash,
        install_dependencies,
        last_success_time: CompiledResourceRecord::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        id::{ResourcePath, ResourceTypeId},
        registry::CompilerInvocation,
    };
    use std::path::PathBuf;

    struct StubCompiler {
        version: i32,
        types: Vec<ResourceTypeId>,
    }

    impl CompilerDescriptor for StubCompiler {
        fn name(&self) -> &str {
            "stub"
        }
        fn version(&self) -> i32 {
            self.version
        }
        fn handled_types(&self) -> &[ResourceTypeId] {
            &self.types
        }
        fn requires_input_file(&self) -> bool {
            true
        }
        fn enumerate_compile_dependencies(
            &self,
            _invocation: &CompilerInvocation,
        ) -> Result<Vec<PathBuf>, crate::error::ServerError> {
            Ok(Vec::new())
        }
        fn enumerate_install_dependencies(
            &self,
            _invocation: &CompilerInvocation,
        ) -> Result<Vec<ResourceId>, crate::error::ServerError> {
            Ok(Vec::new())
        }
        fn invoke(&self, _invocation: &CompilerInvocation) -> std::io::Result<std::process::Child> {
            unimplemented!()
        }
    }

    fn id(path: &str) -> ResourceId {
        ResourceId::new(ResourceTypeId::new(b"msh"), ResourcePath::new(path).unwrap())
    }

    #[test]
    fn missing_artifact_needs_compile() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.msh.src");
        std::fs::write(&source, b"x").unwrap();
        let compiled = dir.path().join("a.msh");
        let compiler = StubCompiler { version: 1, types: vec![ResourceTypeId::new(b"msh")] };
        let records = RecordStore::load(dir.path().join("records.json"));
        let decision = evaluate(&id("data://a.msh"), &source, &compiled, &compiler, &records);
        assert!(!decision.is_up_to_date());
    }

    #[test]
    fn matching_record_and_header_is_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.msh.src");
        std::fs::write(&source, b"x").unwrap();
        let compiled = dir.path().join("a.msh");
        let compiler = StubCompiler { version: 1, types: vec![ResourceTypeId::new(b"msh")] };
        let records = RecordStore::load(dir.path().join("records.json"));

        let record = record_for(&compiler, &id("data://a.msh"), &source, &compiled, Vec::new()).unwrap();
        let header = ResourceHeader {
            compiler_version: compiler.version(),
            install_dependencies: Vec::new(),
            source_data_hash: record.source_timestamp_hash,
        };
        let mut file = std::fs::File::create(&compiled).unwrap();
        header.write_to(&mut file).unwrap();
        records.put(id("data://a.msh"), record).unwrap();

        let decision = evaluate(&id("data://a.msh"), &source, &compiled, &compiler, &records);
        assert!(decision.is_up_to_date());
    }

    #[test]
    fn version_bump_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.msh.src");
        std::fs::write(&source, b"x").unwrap();
        let compiled = dir.path().join("a.msh");
        let old_compiler = StubCompiler { version: 1, types: vec![ResourceTypeId::new(b"msh")] };
        let records = RecordStore::load(dir.path().join("records.json"));
        let record =
            record_for(&old_compiler, &id("data://a.msh"), &source, &compiled, Vec::new()).unwrap();
        let header = ResourceHeader {
            compiler_version: old_compiler.version(),
            install_dependencies: Vec::new(),
            source_data_hash: record.source_timestamp_hash,
        };
        let mut file = std::fs::File::create(&compiled).unwrap();
        header.write_to(&mut file).unwrap();
        records.put(id("data://a.msh"), record).unwrap();

        let new_compiler = StubCompiler { version: 2, types: vec![ResourceTypeId::new(b"msh")] };
        let decision = evaluate(&id("data://a.msh"), &source, &compiled, &new_compiler, &records);
        assert!(!decision.is_up_to_date());
    }

    #[test]
    fn touching_the_source_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.msh.src");
        std::fs::write(&source, b"x").unwrap();
        let compiled = dir.path().join("a.msh");
        let compiler = StubCompiler { version: 1, types: vec![ResourceTypeId::new(b"msh")] };
        let records = RecordStore::load(dir.path().join("records.json"));
        let record = record_for(&compiler, &id("data://a.msh"), &source, &compiled, Vec::new()).unwrap();
        let header = ResourceHeader {
            compiler_version: compiler.version(),
            install_dependencies: Vec::new(),
            source_data_hash: record.source_timestamp_hash,
        };
        let mut file = std::fs::File::create(&compiled).unwrap();
        header.write_to(&mut file).unwrap();
        records.put(id("data://a.msh"), record).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&source, b"changed").unwrap();

        let decision = evaluate(&id("data://a.msh"), &source, &compiled, &compiler, &records);
        assert!(!decision.is_up_to_date());
    }
}
