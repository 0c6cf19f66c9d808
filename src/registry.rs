//! The compiler registry (C3): a static, immutable catalog of which external compiler
//! handles which resource types.
//!
//! Each entry is a value implementing [`CompilerDescriptor`] — a small capability set of
//! `{version, handled_types, enumerate_compile_deps, enumerate_install_deps, invoke}` that
//! replaces the inheritance hierarchy the original engine used for the same purpose. The
//! registry itself never changes after startup, so lookups need no locking.

use std::{
    path::PathBuf,
    process::{Command, Stdio},
    sync::Arc,
};

use crate::{error::ServerError, id::ResourceTypeId};

/// One request to run the external worker binary, built by the scheduler/worker pool from a
/// [`crate::request::CompilationRequest`].
#[derive(Debug, Clone)]
pub struct CompilerInvocation {
    pub resource_type: ResourceTypeId,
    pub input_path: Option<PathBuf>,
    pub output_path: PathBuf,
    pub force: bool,
    pub platform: Option<String>,
}

impl CompilerInvocation {
    /// Builds the `-compile -type=... -input=... -output=... [-force] [-platform=...]`
    /// argument vector described in the wire/subprocess contract.
    pub fn compile_args(&self) -> Vec<String> {
        let mut args = vec!["-compile".to_string(), format!("-type={}", self.resource_type)];
        if let Some(input) = &self.input_path {
            args.push(format!("-input={}", input.display()));
        }
        args.push(format!("-output={}", self.output_path.display()));
        if self.force {
            args.push("-force".to_string());
        }
        if let Some(platform) = &self.platform {
            args.push(format!("-platform={platform}"));
        }
        args
    }

    /// The `-info` variant of the same invocation, used to enumerate dependencies without a
    /// full compile.
    fn info_args(&self) -> Vec<String> {
        let mut args = vec!["-info".to_string(), format!("-type={}", self.resource_type)];
        if let Some(input) = &self.input_path {
            args.push(format!("-input={}", input.display()));
        }
        args.push(format!("-output={}", self.output_path.display()));
        args
    }
}

/// Capability set a registered compiler provides. Implementors are immutable values stored
/// behind `Arc` in the [`CompilerRegistry`]; `enumerate_*` and `invoke` may be called
/// concurrently from multiple worker threads.
pub trait CompilerDescriptor: Send + Sync {
    fn name(&self) -> &str;

    /// Bumping this invalidates every record produced by an older version for this
    /// compiler's types (§4.2).
    fn version(&self) -> i32;

    fn handled_types(&self) -> &[ResourceTypeId];

    fn requires_input_file(&self) -> bool;

    /// Lists the raw files (besides the resource's own source file) whose modification
    /// invalidates the compiled artifact. A lightweight descriptor query, not a full
    /// compile; failure is not fatal to the caller (§4.7 step 5, §7 `NoCompileDependencyInfo`).
    /// Takes the whole [`CompilerInvocation`] (not just a bare path) so the query can report
    /// the resource's real type, the same way [`CompilerDescriptor::enumerate_install_dependencies`]
    /// already does.
    fn enumerate_compile_dependencies(
        &self,
        invocation: &CompilerInvocation,
    ) -> Result<Vec<PathBuf>, ServerError>;

    /// Lists the install-dependencies of the resource at `invocation`, read from the
    /// compiled artifact's header if one exists, or by parsing the source descriptor
    /// otherwise (§4.10).
    fn enumerate_install_dependencies(
        &self,
        invocation: &CompilerInvocation,
    ) -> Result<Vec<crate::id::ResourceId>, ServerError>;

    /// Spawns the compiler subprocess for a full `-compile` run. The caller owns the
    /// returned child for the rest of its lifecycle (waiting, killing on timeout).
    fn invoke(&self, invocation: &CompilerInvocation) -> std::io::Result<std::process::Child>;
}

/// The default, and so far only, [`CompilerDescriptor`] implementation: delegates every
/// capability to the single external `worker_binary_path` executable, distinguishing
/// operations by command-line flag (`-compile` vs `-info`). Per-format compilers are opaque
/// to this crate; this is the one place that shells out to them.
pub struct ExternalCompiler {
    name: String,
    version: i32,
    handled_types: Vec<ResourceTypeId>,
    requires_input_file: bool,
    worker_binary_path: PathBuf,
}

impl ExternalCompiler {
    pub fn new(
        name: impl Into<String>,
        version: i32,
        handled_types: Vec<ResourceTypeId>,
        requires_input_file: bool,
        worker_binary_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            handled_types,
            requires_input_file,
            worker_binary_path: worker_binary_path.into(),
        }
    }
}

impl CompilerDescriptor for ExternalCompiler {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> i32 {
        self.version
    }

    fn handled_types(&self) -> &[ResourceTypeId] {
        &self.handled_types
    }

    fn requires_input_file(&self) -> bool {
        self.requires_input_file
    }

    fn enumerate_compile_dependencies(
        &self,
        invocation: &CompilerInvocation,
    ) -> Result<Vec<PathBuf>, ServerError> {
        let path_for_error = invocation.input_path.as_deref().unwrap_or(&invocation.output_path);
        let resource_for_error = || {
            crate::id::ResourceId::new(
                invocation.resource_type,
                crate::id::ResourcePath::from_relative(path_for_error.to_string_lossy().as_ref()),
            )
        };
        let output = Command::new(&self.worker_binary_path)
            .args(invocation.info_args())
            .arg("-query=compile-deps")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .map_err(|source| ServerError::SubprocessSpawn { resource: resource_for_error(), source })?;
        if !output.status.success() {
            return Err(ServerError::NoCompileDependencyInfo(resource_for_error()));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter(|l| !l.is_empty()).map(PathBuf::from).collect())
    }

    fn enumerate_install_dependencies(
        &self,
        invocation: &CompilerInvocation,
    ) -> Result<Vec<crate::id::ResourceId>, ServerError> {
        if let Ok(header) = crate::header::ResourceHeader::read_from_file(&invocation.output_path)
        {
            return Ok(header.install_dependencies);
        }
        let output = Command::new(&self.worker_binary_path)
            .args(invocation.info_args())
            .arg("-query=install-deps")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .map_err(|source| ServerError::SubprocessSpawn {
                resource: crate::id::ResourceId::new(
                    invocation.resource_type,
                    crate::id::ResourcePath::from_relative(
                        invocation.output_path.to_string_lossy().as_ref(),
                    ),
                ),
                source,
            })?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter(|l| !l.is_empty()).filter_map(|l| l.parse().ok()).collect())
    }

    fn invoke(&self, invocation: &CompilerInvocation) -> std::io::Result<std::process::Child> {
        Command::new(&self.worker_binary_path)
            .args(invocation.compile_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

/// The resource types named in the system's purpose & scope: meshes, skeletons,
/// animations, physics meshes, navmeshes, maps, entity collections, textures, IK rigs, and
/// materials.
pub const STANDARD_RESOURCE_TYPES: &[ResourceTypeId] = &[
    ResourceTypeId::new(b"msh"),
    ResourceTypeId::new(b"ske"),
    ResourceTypeId::new(b"anm"),
    ResourceTypeId::new(b"phs"),
    ResourceTypeId::new(b"nav"),
    ResourceTypeId::new(b"map"),
    ResourceTypeId::new(b"ent"),
    ResourceTypeId::new(b"tex"),
    ResourceTypeId::new(b"ikr"),
    ResourceTypeId::new(b"mat"),
];

/// Builds the catalog a stock deployment registers at startup: every
/// [`STANDARD_RESOURCE_TYPES`] handled by the single external `worker_binary_path`
/// executable, dispatched by `-type` flag (§6).
pub fn default_registry(worker_binary_path: impl Into<PathBuf>) -> CompilerRegistry {
    let mut registry = CompilerRegistry::new();
    registry.register(Arc::new(ExternalCompiler::new(
        "resource-compiler",
        1,
        STANDARD_RESOURCE_TYPES.to_vec(),
        true,
        worker_binary_path,
    )));
    registry
}

/// Immutable catalog of registered compilers, keyed by the resource type they handle.
/// Built once at startup; lookups are lock-free.
#[derive(Clone, Default)]
pub struct CompilerRegistry {
    by_type: std::collections::BTreeMap<ResourceTypeId, Arc<dyn CompilerDescriptor>>,
}

impl CompilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `compiler` for every resource type it declares. Later registrations for an
    /// already-claimed type replace the earlier one.
    pub fn register(&mut self, compiler: Arc<dyn CompilerDescriptor>) {
        for &ty in compiler.handled_types() {
            self.by_type.insert(ty, compiler.clone());
        }
    }

    pub fn get(&self, ty: ResourceTypeId) -> Option<Arc<dyn CompilerDescriptor>> {
        self.by_type.get(&ty).cloned()
    }

    pub fn contains(&self, ty: ResourceTypeId) -> bool {
        self.by_type.contains_key(&ty)
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}
