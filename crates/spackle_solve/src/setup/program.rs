use std::fmt::Write;

use crate::engine::Symbol;

/// Accumulates the facts of a problem as program text.
#[derive(Debug, Default)]
pub(crate) struct ProgramBuilder {
    text: String,
    facts: usize,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a commented section.
    pub fn section(&mut self, title: &str) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        let _ = writeln!(self.text, "%{}", "-".repeat(77));
        let _ = writeln!(self.text, "% {title}");
        let _ = writeln!(self.text, "%{}", "-".repeat(77));
    }

    pub fn fact(&mut self, atom: Symbol) {
        tracing::trace!("fact {atom}");
        let _ = writeln!(self.text, "{atom}.");
        self.facts += 1;
    }

    pub fn len(&self) -> usize {
        self.facts
    }

    pub fn finish(self) -> String {
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::ProgramBuilder;
    use crate::engine::program::{parse_program, Statement};

    #[test]
    fn test_program_text_parses_back() {
        let mut program = ProgramBuilder::new();
        program.section("zlib");
        program.fact(crate::sym!("pkg_fact", "zlib", crate::sym!("namespace", "builtin")));
        program.fact(crate::sym!("literal", 0i64, 1i64));
        assert_eq!(program.len(), 2);

        let text = program.finish();
        let statements = parse_program("problem", &text).unwrap();
        assert_eq!(statements.len(), 2);
        assert!(matches!(&statements[1], Statement::Fact(f) if f.is("literal", 2)));
    }
}
