use std::collections::HashMap;

use super::program::ProgramBuilder;
use crate::{engine::Symbol, sym};

/// Assigns ids to conditions and writes their facts. Identical triggers, effects and conditions
/// share an id so that the program stays small.
#[derive(Debug, Default)]
pub(crate) struct ConditionTable {
    next_id: i64,
    triggers: HashMap<Vec<Symbol>, i64>,
    effects: HashMap<Vec<Symbol>, i64>,
    conditions: HashMap<(i64, i64), i64>,
}

impl ConditionTable {
    fn next(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Returns the id of the condition with the given trigger and effect.
    pub fn condition(
        &mut self,
        program: &mut ProgramBuilder,
        trigger: Vec<Symbol>,
        effect: Vec<Symbol>,
        description: &str,
    ) -> i64 {
        let trigger_id = match self.triggers.get(&trigger) {
            Some(id) => *id,
            None => {
                let id = self.next();
                for clause in &trigger {
                    program.fact(sym!("trigger_clause", id, clause.clone()));
                }
                self.triggers.insert(trigger, id);
                id
            }
        };
        let effect_id = match self.effects.get(&effect) {
            Some(id) => *id,
            None => {
                let id = self.next();
                for clause in &effect {
                    program.fact(sym!("effect_clause", id, clause.clone()));
                }
                self.effects.insert(effect, id);
                id
            }
        };
        if let Some(id) = self.conditions.get(&(trigger_id, effect_id)) {
            return *id;
        }
        let id = self.next();
        program.fact(sym!("condition_trigger", id, trigger_id));
        program.fact(sym!("condition_effect", id, effect_id));
        program.fact(sym!("condition_desc", id, description));
        self.conditions.insert((trigger_id, effect_id), id);
        id
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::ConditionTable;
    use crate::{setup::program::ProgramBuilder, sym};

    #[test]
    fn test_identical_conditions_share_an_id() {
        let mut program = ProgramBuilder::new();
        let mut table = ConditionTable::default();
        let trigger = vec![sym!("node", "zlib")];
        let effect = vec![sym!("node", "cmake")];

        let first = table.condition(&mut program, trigger.clone(), effect.clone(), "a");
        let facts = program.len();
        let second = table.condition(&mut program, trigger.clone(), effect, "b");
        assert_eq!(first, second);
        assert_eq!(program.len(), facts);

        let third = table.condition(&mut program, trigger, Vec::new(), "c");
        assert_ne!(first, third);
        assert_eq!(table.len(), 2);
        assert!(program.finish().contains("condition_desc(5,\"c\")"));
    }
}
