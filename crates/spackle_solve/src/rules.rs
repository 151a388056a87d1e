//! The logic programs shipped with the crate.
//!
//! Every solve loads [`CONCRETIZE`], [`HEURISTIC`] and [`DISPLAY`]. Exactly one of the
//! compatibility programs is loaded depending on whether the host declares a libc.
//! [`WHEN_POSSIBLE`] is added when literals may be left unsolved and [`CAUSATION`] is only used
//! to explain a failed solve.

/// Optimization criteria, the error catalogue and the derived relations.
pub const CONCRETIZE: &str = include_str!("rules/concretize.lp");

/// The order in which the search decides the attributes of a node.
pub const HEURISTIC: &str = include_str!("rules/heuristic.lp");

/// Operating system compatibility when the host has no libc declared.
pub const OS_COMPATIBILITY: &str = include_str!("rules/os_compatibility.lp");

/// Operating system compatibility when the host declares a libc.
pub const LIBC_COMPATIBILITY: &str = include_str!("rules/libc_compatibility.lp");

/// Allows input literals to stay unsolved at a cost.
pub const WHEN_POSSIBLE: &str = include_str!("rules/when_possible.lp");

/// The atoms a model reports back.
pub const DISPLAY: &str = include_str!("rules/display.lp");

/// Joins failed conditions with the impositions that made them hold.
pub const CAUSATION: &str = include_str!("rules/causation.lp");

/// A program together with the name it is loaded under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleFile {
    /// The name used in engine error messages.
    pub name: &'static str,
    /// The program text.
    pub text: &'static str,
}

/// The programs loaded for a solve, in load order.
pub fn solve_programs(has_libc: bool, optional_literals: bool) -> Vec<RuleFile> {
    let mut files = vec![
        RuleFile {
            name: "concretize.lp",
            text: CONCRETIZE,
        },
        RuleFile {
            name: "heuristic.lp",
            text: HEURISTIC,
        },
    ];
    files.push(if has_libc {
        RuleFile {
            name: "libc_compatibility.lp",
            text: LIBC_COMPATIBILITY,
        }
    } else {
        RuleFile {
            name: "os_compatibility.lp",
            text: OS_COMPATIBILITY,
        }
    });
    if optional_literals {
        files.push(RuleFile {
            name: "when_possible.lp",
            text: WHEN_POSSIBLE,
        });
    }
    files.push(RuleFile {
        name: "display.lp",
        text: DISPLAY,
    });
    files
}

#[cfg(test)]
mod tests {
    use super::solve_programs;
    use crate::engine::program::parse_program;

    #[test]
    fn test_rule_files_parse() {
        for file in solve_programs(true, true)
            .into_iter()
            .chain(solve_programs(false, false))
        {
            parse_program(file.name, file.text).unwrap();
        }
        parse_program("causation.lp", super::CAUSATION).unwrap();
    }

    #[test]
    fn test_compatibility_program_selection() {
        let names: Vec<&str> = solve_programs(false, false).iter().map(|f| f.name).collect();
        assert!(names.contains(&"os_compatibility.lp"));
        assert!(!names.contains(&"when_possible.lp"));
        let names: Vec<&str> = solve_programs(true, true).iter().map(|f| f.name).collect();
        assert!(names.contains(&"libc_compatibility.lp"));
        assert!(names.contains(&"when_possible.lp"));
    }
}
