//! Demonstration entry point: `cobble init --reinit <root>` builds one
//! hard-coded project (two targets sharing a dependency, evaluated in two
//! environments, mirroring spec.md §8 scenario 5) and writes a
//! Ninja-shaped manifest next to it. A real loader that reads `BUILD`
//! files and hosts plugins is out of scope (spec.md §1); this exists so
//! the regeneration touch-point in spec.md §6 is something you can
//! actually run.

use std::fs;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use cobble::delta::Delta;
use cobble::env::Environment;
use cobble::frozen::Value;
use cobble::product::ProductBuilder;
use cobble::project::Project;
use cobble::registry::EnvKey;
use cobble::target::{no_products, Target, UsingContext};
use tracing::info;

struct RunConfig {
    reinit: bool,
    project_root: String,
}

fn parse_bool(flag: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(anyhow!("flag {flag} expects a boolean, got {other:?}")),
    }
}

fn parse_args(args: &[String]) -> Result<RunConfig> {
    let mut reinit = false;
    let mut project_root = None;
    let mut i = 0;
    if args.first().map(String::as_str) != Some("init") {
        return Err(anyhow!("usage: cobble init [--reinit true|false] <project-root>"));
    }
    i += 1;
    while i < args.len() {
        match args[i].as_str() {
            "--reinit" => {
                let value = args.get(i + 1).context("--reinit requires a value")?;
                reinit = parse_bool("--reinit", value)?;
                i += 2;
            }
            other if !other.starts_with("--") => {
                project_root = Some(other.to_string());
                i += 1;
            }
            other => return Err(anyhow!("unrecognized flag {other:?}")),
        }
    }
    Ok(RunConfig { reinit, project_root: project_root.context("missing <project-root>")? })
}

fn build_demo_project(root: &str) -> Result<(Rc<Project>, Rc<Target>, Rc<Target>, Rc<Environment>, Rc<Environment>)> {
    let mut project = Project::new(root, format!("{root}/build"));
    {
        let reg = project.registry_mut();
        reg.define(EnvKey::overrideable_string("CC"))?;
        reg.define(EnvKey::appending_string_seq("C_FLAGS"))?;
    }
    let project = Rc::new(project);
    let pkg = project.clone().add_package("lib").map_err(|e| anyhow!(e.to_string()))?;

    let leaf = Target::new(
        pkg.clone(),
        "util",
        Delta::None,
        Delta::None,
        Vec::new(),
        false,
        true,
        std::rc::Rc::new(|ctx: &UsingContext| {
            let outputs = ctx.rewrite_sources(&["util.o".to_string()])?;
            let product = ProductBuilder::new(ctx.env.clone(), "compile_c_obj", outputs).build()?;
            Ok((Delta::None, vec![product]))
        }),
    )
    .map_err(|e| anyhow!(e.to_string()))?;
    pkg.add_target(leaf.clone()).map_err(|e| anyhow!(e.to_string()))?;

    let bin = Target::new(
        pkg.clone(),
        "app",
        Delta::None,
        Delta::None,
        vec!["//lib:util".to_string()],
        false,
        true,
        no_products(),
    )
    .map_err(|e| anyhow!(e.to_string()))?;
    pkg.add_target(bin.clone()).map_err(|e| anyhow!(e.to_string()))?;

    let base = Rc::new(Environment::empty(project.base_registry()));
    let debug_env = Rc::new(
        base.derive(&Delta::map([("CC".to_string(), Value::str("gcc")), ("C_FLAGS".to_string(), Value::tuple([Value::str("-g")]))]))
            .map_err(|e| anyhow!(e.to_string()))?,
    );
    let release_env = Rc::new(
        base.derive(&Delta::map([
            ("CC".to_string(), Value::str("gcc")),
            ("C_FLAGS".to_string(), Value::tuple([Value::str("-O2")])),
        ]))
        .map_err(|e| anyhow!(e.to_string()))?,
    );

    Ok((project, leaf, bin, debug_env, release_env))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = parse_args(&args)?;

    if !config.reinit {
        info!("first-time init is not implemented by this demonstration binary; pass --reinit true");
    }

    let (project, _leaf, app, debug_env, release_env) = build_demo_project(&config.project_root)?;

    let mut writer = cobble::ninja::Writer::new();
    writer.regeneration_rule(&config.project_root);
    writer.rule("compile_c_obj", "$CC $C_FLAGS -c -o $out $in");

    for env in [debug_env, release_env] {
        let result = app.evaluate(Some(env)).map_err(|e| anyhow!(e.to_string()))?;
        for products in result.product_map.values() {
            for product in products.iter() {
                writer.build(product);
            }
        }
    }

    let manifest_path = format!("{}/build.ninja", project.build_dir);
    fs::create_dir_all(&project.build_dir).with_context(|| format!("creating {}", project.build_dir))?;
    fs::write(&manifest_path, writer.finish()).with_context(|| format!("writing {manifest_path}"))?;
    info!(manifest = %manifest_path, "wrote build manifest");

    Ok(())
}
