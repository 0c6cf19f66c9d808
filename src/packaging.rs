//! The packaging driver (C10): expands a set of seed "map" resources into the full
//! install-dependency closure and feeds them to the scheduler as forced recompiles.

use std::collections::{BTreeSet, VecDeque};

use crate::{id::ResourceId, paths::PathRoots, registry::{CompilerInvocation, CompilerRegistry}};

/// A running (or just-completed) packaging sweep. Install-dependency closures are asserted
/// acyclic by producer compilers but expansion uses a visited set regardless, so a cycle is
/// silently collapsed rather than looping forever (§9).
pub struct PackagingSession {
    maps_queued: Vec<ResourceId>,
    resources_to_package: BTreeSet<ResourceId>,
    completed: BTreeSet<ResourceId>,
    is_packaging: bool,
}

impl PackagingSession {
    /// Runs the closure expansion in §4.10 steps 1-2 up front; the result's `is_packaging()`
    /// is `true` as soon as expansion finishes (step 3), before any resource has actually
    /// been (re)compiled.
    pub fn expand(maps: Vec<ResourceId>, registry: &CompilerRegistry, paths: &PathRoots) -> Self {
        let mut resources_to_package = BTreeSet::new();
        let mut frontier: VecDeque<ResourceId> = maps.iter().cloned().collect();

        while let Some(resource_id) = frontier.pop_front() {
            if resources_to_package.contains(&resource_id) {
                continue;
            }
            resources_to_package.insert(resource_id.clone());

            let Some(compiler) = registry.get(resource_id.resource_type()) else { continue };
            let invocation = CompilerInvocation {
                resource_type: resource_id.resource_type(),
                input_path: compiler.requires_input_file().then(|| paths.to_raw(resource_id.path())),
                output_path: paths.to_compiled(resource_id.path()),
                force: false,
                platform: None,
            };
            let Ok(deps) = compiler.enumerate_install_dependencies(&invocation) else { continue };
            for dep in deps {
                if !resources_to_package.contains(&dep) {
                    frontier.push_back(dep);
                }
            }
        }

        Self { maps_queued: maps, resources_to_package, completed: BTreeSet::new(), is_packaging: true }
    }

    pub fn maps_queued(&self) -> &[ResourceId] {
        &self.maps_queued
    }

    pub fn resources_to_package(&self) -> &BTreeSet<ResourceId> {
        &self.resources_to_package
    }

    pub fn is_completed(&self, id: &ResourceId) -> bool {
        self.completed.contains(id)
    }

    pub fn is_packaging(&self) -> bool {
        self.is_packaging
    }

    /// `|completed| / |resources_to_package|`, monotonically non-decreasing as the sweep
    /// progresses, reaching `1.0` exactly when every resource in the closure has reached a
    /// terminal status (§4.10).
    pub fn progress(&self) -> f64 {
        if self.resources_to_package.is_empty() {
            return 1.0;
        }
        self.completed.len() as f64 / self.resources_to_package.len() as f64
    }

    /// Records a terminal completion for `id`. A `Failed` compile during packaging still
    /// counts as complete, per §4.10's failure policy — progress keeps advancing and the
    /// rest of the sweep is not aborted.
    pub fn mark_completed(&mut self, id: &ResourceId) {
        if self.resources_to_package.contains(id) {
            self.completed.insert(id.clone());
            if self.completed.len() == self.resources_to_package.len() {
                self.is_packaging = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        id::{ResourcePath, ResourceTypeId},
        registry::CompilerDescriptor,
    };
    use std::{path::PathBuf, sync::Arc};

    /// A compiler whose install-dependencies are looked up per resource id, used to exercise
    /// closure expansion without any real subprocess.
    struct FixedDepsCompiler {
        types: Vec<ResourceTypeId>,
        deps_by_path: std::collections::BTreeMap<ResourceId, Vec<ResourceId>>,
    }

    impl CompilerDescriptor for FixedDepsCompiler {
        fn name(&self) -> &str {
            "fixed-deps"
        }
        fn version(&self) -> i32 {
            1
        }
        fn handled_types(&self) -> &[ResourceTypeId] {
            &self.types
        }
        fn requires_input_file(&self) -> bool {
            false
        }
        fn enumerate_compile_dependencies(
            &self,
            _invocation: &CompilerInvocation,
        ) -> Result<Vec<PathBuf>, crate::error::ServerError> {
            Ok(Vec::new())
        }
        fn enumerate_install_dependencies(
            &self,
            invocation: &CompilerInvocation,
        ) -> Result<Vec<ResourceId>, crate::error::ServerError> {
            // The fixture keys its canned answer off the resource the compiled path was
            // derived for, which `PackagingSession::expand` always sets to `paths.to_compiled`.
            Ok(self
                .deps_by_path
                .iter()
                .find(|(id, _)| invocation.output_path.ends_with(id.path().relative()))
                .map(|(_, deps)| deps.clone())
                .unwrap_or_default())
        }
        fn invoke(&self, _invocation: &CompilerInvocation) -> std::io::Result<std::process::Child> {
            unimplemented!()
        }
    }

    fn id(tag: &[u8], path: &str) -> ResourceId {
        ResourceId::new(ResourceTypeId::new(tag), ResourcePath::new(path).unwrap())
    }

    #[test]
    fn expands_a_transitive_closure_of_six_unique_resources() {
        let map = id(b"map", "data://levels/a.map");
        let dep_a = id(b"msh", "data://a.msh");
        let dep_b = id(b"msh", "data://b.msh");
        let dep_c = id(b"msh", "data://c.msh");
        let leaf_d = id(b"tex", "data://d.tex");
        let leaf_e = id(b"tex", "data://e.tex");

        let mut deps_by_path = std::collections::BTreeMap::new();
        deps_by_path.insert(map.clone(), vec![dep_a.clone(), dep_b.clone(), dep_c.clone()]);
        // dep_a additionally pulls in two more leaves, matching the S6 scenario shape.
        deps_by_path.insert(dep_a.clone(), vec![leaf_d.clone(), leaf_e.clone()]);

        let mut registry = CompilerRegistry::new();
        registry.register(Arc::new(FixedDepsCompiler {
            types: vec![ResourceTypeId::new(b"map"), ResourceTypeId::new(b"msh"), ResourceTypeId::new(b"tex")],
            deps_by_path,
        }));

        let paths = PathRoots::new("/raw", "/compiled");
        let session = PackagingSession::expand(vec![map.clone()], &registry, &paths);

        assert_eq!(session.resources_to_package().len(), 6);
        assert!(session.resources_to_package().contains(&map));
        assert!(session.resources_to_package().contains(&leaf_d));
        assert!(session.resources_to_package().contains(&leaf_e));
        assert!(session.is_packaging());
    }

    #[test]
    fn cycles_are_collapsed_instead_of_looping() {
        let a = id(b"map", "data://a.map");
        let b = id(b"map", "data://b.map");

        let mut deps_by_path = std::collections::BTreeMap::new();
        deps_by_path.insert(a.clone(), vec![b.clone()]);
        deps_by_path.insert(b.clone(), vec![a.clone()]);
        let mut registry = CompilerRegistry::new();
        registry.register(Arc::new(FixedDepsCompiler {
            types: vec![ResourceTypeId::new(b"map")],
            deps_by_path,
        }));

        let paths = PathRoots::new("/raw", "/compiled");
        let session = PackagingSession::expand(vec![a.clone()], &registry, &paths);
        assert_eq!(session.resources_to_package().len(), 2);
    }

    #[test]
    fn progress_reaches_one_when_everything_completes() {
        let a = id(b"map", "data://a.map");
        let mut registry = CompilerRegistry::new();
        registry.register(Arc::new(FixedDepsCompiler {
            types: vec![ResourceTypeId::new(b"map")],
            deps_by_path: std::collections::BTreeMap::new(),
        }));
        let paths = PathRoots::new("/raw", "/compiled");
        let mut session = PackagingSession::expand(vec![a.clone()], &registry, &paths);
        assert_eq!(session.progress(), 0.0);
        session.mark_completed(&a);
        assert_eq!(session.progress(), 1.0);
        assert!(!session.is_packaging());
    }

    #[test]
    fn a_failed_compile_still_counts_toward_progress() {
        let a = id(b"map", "data://a.map");
        let mut registry = CompilerRegistry::new();
        registry.register(Arc::new(FixedDepsCompiler {
            types: vec![ResourceTypeId::new(b"map")],
            deps_by_path: std::collections::BTreeMap::new(),
        }));
        let paths = PathRoots::new("/raw", "/compiled");
        let mut session = PackagingSession::expand(vec![a.clone()], &registry, &paths);
        // A failed compile is still a terminal completion from the scheduler's point of
        // view; mark_completed doesn't distinguish success from failure (§4.10).
        session.mark_completed(&a);
        assert_eq!(session.progress(), 1.0);
    }
}
