//! A minimal Ninja-file writer, grounded in
//! `cobble/ninja_syntax.py` and `cobble/output.py`. A full emitter (rule
//! conflict resolution across plugins, response files, ...) is out of
//! scope (spec.md §1); this exists only so the demonstration binary has a
//! real file to write instead of a stub. A product's `dyndep` file, when
//! set, is emitted as a build-edge variable.

use std::fmt::Write as _;

use crate::product::Product;

fn escape_path(path: &str) -> String {
    path.replace('$', "$$").replace(' ', "$ ").replace(':', "$:")
}

pub struct Writer {
    buf: String,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    pub fn comment(&mut self, text: &str) {
        let _ = writeln!(self.buf, "# {text}");
    }

    pub fn variable(&mut self, name: &str, value: &str) {
        let _ = writeln!(self.buf, "{name} = {value}");
    }

    pub fn rule(&mut self, name: &str, command: &str) {
        let _ = writeln!(self.buf, "rule {name}\n  command = {command}");
    }

    /// The regeneration rule every project carries, matching
    /// `output.py`'s `cobble_generate_ninja` rule that reinvokes the
    /// loader when `BUILD`/`BUILD.conf` files change.
    pub fn regeneration_rule(&mut self, project_root: &str) {
        self.comment("regenerate build.ninja when inputs change");
        self.rule("cobble_generate_ninja", &format!("./cobble init --reinit {project_root}"));
    }

    pub fn build(&mut self, product: &Product) {
        let outputs = product.outputs.iter().map(|o| escape_path(o)).collect::<Vec<_>>().join(" ");
        let inputs = product.inputs.iter().map(|i| escape_path(i)).collect::<Vec<_>>().join(" ");
        let _ = write!(self.buf, "build {outputs}: {}", product.rule);
        if !inputs.is_empty() {
            let _ = write!(self.buf, " {inputs}");
        }
        if !product.implicit.is_empty() {
            let _ = write!(self.buf, " | {}", product.implicit.iter().map(|s| escape_path(s)).collect::<Vec<_>>().join(" "));
        }
        if !product.order_only.is_empty() {
            let _ = write!(self.buf, " || {}", product.order_only.iter().map(|s| escape_path(s)).collect::<Vec<_>>().join(" "));
        }
        let _ = writeln!(self.buf);
        for (k, v) in &product.variables {
            let _ = writeln!(self.buf, "  {k} = {v}");
        }
        if let Some(dyndep) = &product.dyndep {
            let _ = writeln!(self.buf, "  dyndep = {}", escape_path(dyndep));
        }
        if let Some(link) = &product.symlink_as {
            let _ = writeln!(self.buf, "build {}: cobble_symlink {}", escape_path(link), escape_path(&product.outputs[0]));
        }
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_spaces_and_colons() {
        assert_eq!(escape_path("a b:c"), "a$ b$:c");
    }
}
