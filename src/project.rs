//! Projects and packages: path scheme, identifier resolution, and the
//! owning structures a target lives inside (spec.md §3, §4.7,
//! `cobble/project.py`).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::error::CobbleError;
use crate::registry::KeyRegistry;
use crate::target::Target;

/// A `BUILD`-file-sized grouping of targets at one path under the project
/// root.
pub struct Package {
    project: Weak<Project>,
    pub relpath: String,
    targets: RefCell<BTreeMap<String, Rc<Target>>>,
}

impl Package {
    pub fn project(&self) -> Rc<Project> {
        self.project.upgrade().expect("package outlived its project")
    }

    pub fn add_target(&self, target: Rc<Target>) -> Result<(), CobbleError> {
        let mut targets = self.targets.borrow_mut();
        if targets.contains_key(&target.name) {
            return Err(CobbleError::DuplicateTarget { package: self.relpath.clone(), name: target.name.clone() });
        }
        targets.insert(target.name.clone(), target);
        Ok(())
    }

    pub fn find_target_local(&self, name: &str) -> Result<Rc<Target>, CobbleError> {
        self.targets
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| CobbleError::UnknownTarget(self.target_ident(name)))
    }

    /// `//:name` for a package at the project root, `//relpath:name`
    /// otherwise (`cobble/target/__init__.py::Target.ident`).
    pub fn target_ident(&self, name: &str) -> String {
        if self.relpath == "." || self.relpath.is_empty() {
            format!("//:{name}")
        } else {
            format!("//{}:{name}", self.relpath)
        }
    }

    pub fn inpath(&self, rel: &str) -> String {
        self.project().inpath(&join(&self.relpath, rel))
    }

    pub fn outpath(&self, env_digest: &str, rel: &str) -> String {
        self.project().outpath(env_digest, &join(&self.relpath, rel))
    }

    pub fn linkpath(&self, rel: &str) -> String {
        self.project().linkpath(&join(&self.relpath, rel))
    }
}

fn join(relpath: &str, rel: &str) -> String {
    if relpath.is_empty() || relpath == "." {
        rel.to_string()
    } else if rel.is_empty() {
        relpath.to_string()
    } else {
        format!("{relpath}/{rel}")
    }
}

/// Splits `//pkg:name` into `("pkg", "name")`, applying the bare
/// `//pkg` shorthand that resolves to the target named after the
/// package's last path component (`cobble/project.py::Project.find_target`).
fn split_absolute(ident: &str) -> Result<(String, String), CobbleError> {
    let rest = ident.strip_prefix("//").ok_or_else(|| CobbleError::BadIdentifier(ident.to_string()))?;
    match rest.split_once(':') {
        Some((pkg, name)) => Ok((pkg.to_string(), name.to_string())),
        None => {
            let name = rest.rsplit('/').next().unwrap_or(rest).to_string();
            Ok((rest.to_string(), name))
        }
    }
}

/// A build tree rooted at `root`, emitting into `build_dir`.
pub struct Project {
    pub root: String,
    pub build_dir: String,
    registry: RefCell<Rc<KeyRegistry>>,
    packages: RefCell<BTreeMap<String, Rc<Package>>>,
    named_envs: RefCell<BTreeMap<String, Rc<crate::env::Environment>>>,
}

impl Project {
    pub fn new(root: impl Into<String>, build_dir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            build_dir: build_dir.into(),
            registry: RefCell::new(Rc::new(KeyRegistry::with_reserved_keys())),
            packages: RefCell::new(BTreeMap::new()),
            named_envs: RefCell::new(BTreeMap::new()),
        }
    }

    /// Only valid before any package/target/environment has been built
    /// against this project's registry (loading-time only, spec.md §5).
    pub fn registry_mut(&mut self) -> &mut KeyRegistry {
        Rc::get_mut(self.registry.get_mut()).expect("registry mutated after sharing began")
    }

    pub fn base_registry(&self) -> Rc<KeyRegistry> {
        self.registry.borrow().clone()
    }

    pub fn add_package(self: Rc<Self>, relpath: impl Into<String>) -> Result<Rc<Package>, CobbleError> {
        let relpath = relpath.into();
        let pkg = Rc::new(Package { project: Rc::downgrade(&self), relpath: relpath.clone(), targets: RefCell::new(BTreeMap::new()) });
        self.packages.borrow_mut().insert(relpath, pkg.clone());
        Ok(pkg)
    }

    pub fn find_package(&self, relpath: &str) -> Option<Rc<Package>> {
        self.packages.borrow().get(relpath).cloned()
    }

    pub fn find_target(&self, ident: &str) -> Result<Rc<Target>, CobbleError> {
        let (relpath, name) = split_absolute(ident)?;
        let pkg = self.find_package(&relpath).ok_or_else(|| CobbleError::UnknownTarget(ident.to_string()))?;
        pkg.find_target_local(&name)
    }

    pub fn define_environment(&self, name: impl Into<String>, env: Rc<crate::env::Environment>) -> Result<(), CobbleError> {
        let name = name.into();
        let mut envs = self.named_envs.borrow_mut();
        if envs.contains_key(&name) {
            return Err(CobbleError::DuplicateKey(name));
        }
        envs.insert(name, env);
        Ok(())
    }

    pub fn named_environment(&self, name: &str) -> Option<Rc<crate::env::Environment>> {
        self.named_envs.borrow().get(name).cloned()
    }

    pub fn inpath(&self, rel: &str) -> String {
        format!("{}/{}", self.root, rel)
    }

    /// `<build-dir>/env/<digest>/<rel>` (spec.md §3 product path scheme).
    pub fn outpath(&self, env_digest: &str, rel: &str) -> String {
        format!("{}/env/{}/{}", self.build_dir, env_digest, rel)
    }

    /// `<build-dir>/latest/<rel>`.
    pub fn linkpath(&self, rel: &str) -> String {
        format!("{}/latest/{}", self.build_dir, rel)
    }

    pub fn packages(&self) -> Vec<Rc<Package>> {
        self.packages.borrow().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_package_uses_shorthand_ident() {
        let project = Rc::new(Project::new("/root", "/root/build"));
        let pkg = project.clone().add_package(".").unwrap();
        assert_eq!(pkg.target_ident("foo"), "//:foo");
    }

    #[test]
    fn nested_package_ident_includes_relpath() {
        let project = Rc::new(Project::new("/root", "/root/build"));
        let pkg = project.clone().add_package("lib/core").unwrap();
        assert_eq!(pkg.target_ident("foo"), "//lib/core:foo");
    }

    #[test]
    fn bare_package_ident_resolves_to_last_path_component() {
        let (relpath, name) = split_absolute("//lib/core").unwrap();
        assert_eq!(relpath, "lib/core");
        assert_eq!(name, "core");
    }

    #[test]
    fn outpath_joins_build_dir_env_digest_and_relpath() {
        let project = Project::new("/root", "/root/build");
        assert_eq!(project.outpath("abc123", "lib/foo.o"), "/root/build/env/abc123/lib/foo.o");
        assert_eq!(project.linkpath("lib/foo.o"), "/root/build/latest/lib/foo.o");
    }
}
