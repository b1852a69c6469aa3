// ABOUTME: Compiles line-oriented state table text into an executable transition graph
// ABOUTME: Validates destinations and reports unreachable or dead-end states

use indexmap::IndexMap;
use petgraph::graph::NodeIndex;
use petgraph::visit::{Bfs, Reversed};
use petgraph::Graph;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use super::error::{CompileError, EngineError};
use super::result::StepStatus;

/// Transition value taken when state logic returns an empty value.
pub const DEFAULT_TRANSITION: &str = "*";

/// Reserved destinations that finish the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    Complete,
    Warning,
    UserError,
    SystemError,
    Terminated,
}

impl Terminal {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "@complete" => Some(Terminal::Complete),
            "@warning" => Some(Terminal::Warning),
            "@user_error" => Some(Terminal::UserError),
            "@system_error" => Some(Terminal::SystemError),
            "@terminated" => Some(Terminal::Terminated),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Terminal::Complete => "@complete",
            Terminal::Warning => "@warning",
            Terminal::UserError => "@user_error",
            Terminal::SystemError => "@system_error",
            Terminal::Terminated => "@terminated",
        }
    }

    pub fn step_status(&self) -> StepStatus {
        match self {
            Terminal::Complete => StepStatus::Ok,
            Terminal::Warning => StepStatus::Warning,
            Terminal::UserError => StepStatus::UserError,
            Terminal::SystemError => StepStatus::SystemError,
            Terminal::Terminated => StepStatus::Terminated,
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    State(String),
    Terminal(Terminal),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::State(state) => f.write_str(state),
            Destination::Terminal(terminal) => write!(f, "{}", terminal),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub destination: Destination,
    pub wait_seconds: u64,
    /// Zero means unlimited.
    pub max_attempts: u32,
}

impl Transition {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_seconds)
    }
}

struct Rule<'a> {
    line: usize,
    state: &'a str,
    value: &'a str,
    destination: &'a str,
    wait_seconds: u64,
    max_attempts: u32,
}

/// Compiled form of a state table.
///
/// Compiling the same text always yields an equal table, so a persisted task
/// can recompile on resume.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionTable {
    start_state: String,
    states: IndexMap<String, IndexMap<String, Transition>>,
    warnings: Vec<String>,
}

impl TransitionTable {
    /// Parses `State Value Next Wait MaxAttempts` rules, one per line.
    ///
    /// The first rule's state is the start state. `#` starts a comment.
    pub fn compile(text: &str) -> Result<Self, CompileError> {
        let rules = parse_rules(text)?;
        let start_state = rules.first().map(|r| r.state).ok_or(CompileError::Empty)?;

        let mut states: IndexMap<String, IndexMap<String, Transition>> = IndexMap::new();
        for rule in &rules {
            states.entry(rule.state.to_string()).or_default();
        }

        for rule in &rules {
            let destination = if rule.destination.starts_with('@') {
                Terminal::parse(rule.destination)
                    .map(Destination::Terminal)
                    .ok_or_else(|| CompileError::UnknownTerminal {
                        line: rule.line,
                        name: rule.destination.to_string(),
                    })?
            } else if states.contains_key(rule.destination) {
                Destination::State(rule.destination.to_string())
            } else {
                return Err(CompileError::UndefinedState {
                    line: rule.line,
                    state: rule.destination.to_string(),
                });
            };

            let transitions = states.entry(rule.state.to_string()).or_default();
            if transitions.contains_key(rule.value) {
                return Err(CompileError::DuplicateTransition {
                    line: rule.line,
                    state: rule.state.to_string(),
                    value: rule.value.to_string(),
                });
            }
            transitions.insert(
                rule.value.to_string(),
                Transition {
                    destination,
                    wait_seconds: rule.wait_seconds,
                    max_attempts: rule.max_attempts,
                },
            );
        }

        let mut table = Self {
            start_state: start_state.to_string(),
            states,
            warnings: Vec::new(),
        };
        table.warnings = table.analyze();
        Ok(table)
    }

    pub fn start_state(&self) -> &str {
        &self.start_state
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.contains_key(state)
    }

    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    pub fn transitions(&self, state: &str) -> Option<&IndexMap<String, Transition>> {
        self.states.get(state)
    }

    /// Non-fatal findings such as unreachable states.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Every (state, value, transition) triple in table order.
    pub fn entries(&self) -> Vec<(&str, &str, &Transition)> {
        self.states
            .iter()
            .flat_map(|(state, transitions)| {
                transitions
                    .iter()
                    .map(move |(value, t)| (state.as_str(), value.as_str(), t))
            })
            .collect()
    }

    /// Finds the transition for `value` in `state`.
    ///
    /// An empty value takes the `*` rule, or the state's only rule when it has
    /// exactly one. Any other miss is an incomplete table.
    pub fn lookup(&self, state: &str, value: &str) -> Result<&Transition, EngineError> {
        let transitions = self
            .states
            .get(state)
            .ok_or_else(|| EngineError::UnknownState {
                state: state.to_string(),
            })?;

        if let Some(transition) = transitions.get(value) {
            return Ok(transition);
        }
        if value.is_empty() {
            if let Some(transition) = transitions.get(DEFAULT_TRANSITION) {
                return Ok(transition);
            }
            if transitions.len() == 1 {
                if let Some((_, transition)) = transitions.get_index(0) {
                    return Ok(transition);
                }
            }
        }

        Err(EngineError::UnmatchedTransition {
            state: state.to_string(),
            value: value.to_string(),
        })
    }

    fn analyze(&self) -> Vec<String> {
        let mut graph: Graph<String, ()> = Graph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
        for state in self.states.keys() {
            indices.insert(state.as_str(), graph.add_node(state.clone()));
        }
        let finish = graph.add_node("@finish".to_string());

        for (state, transitions) in &self.states {
            let from = indices[state.as_str()];
            for transition in transitions.values() {
                let to = match &transition.destination {
                    Destination::State(next) => indices[next.as_str()],
                    Destination::Terminal(_) => finish,
                };
                graph.update_edge(from, to, ());
            }
        }

        let mut reachable = HashSet::new();
        let mut bfs = Bfs::new(&graph, indices[self.start_state.as_str()]);
        while let Some(node) = bfs.next(&graph) {
            reachable.insert(node);
        }

        // Walk edges backwards from the finish node
        let reversed = Reversed(&graph);
        let mut can_finish = HashSet::new();
        let mut bfs = Bfs::new(reversed, finish);
        while let Some(node) = bfs.next(reversed) {
            can_finish.insert(node);
        }

        let mut warnings = Vec::new();
        for state in self.states.keys() {
            let node = indices[state.as_str()];
            if !reachable.contains(&node) {
                warnings.push(format!(
                    "State '{}' is unreachable from start state '{}'",
                    state, self.start_state
                ));
            } else if !can_finish.contains(&node) {
                warnings.push(format!(
                    "State '{}' can never reach a terminal destination",
                    state
                ));
            }
        }
        warnings
    }
}

fn parse_rules(text: &str) -> Result<Vec<Rule<'_>>, CompileError> {
    let mut rules = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let content = raw.split('#').next().unwrap_or_default().trim();
        if content.is_empty() {
            continue;
        }

        let fields: Vec<&str> = content.split_whitespace().collect();
        let [state, value, destination, wait, attempts] = fields[..] else {
            return Err(CompileError::FieldCount {
                line,
                found: fields.len(),
            });
        };

        if state.starts_with('@') {
            return Err(CompileError::ReservedState {
                line,
                state: state.to_string(),
            });
        }

        let wait_seconds = wait.parse::<u64>().map_err(|_| CompileError::InvalidNumber {
            line,
            field: "WaitSeconds",
            value: wait.to_string(),
        })?;
        let max_attempts = attempts
            .parse::<u32>()
            .map_err(|_| CompileError::InvalidNumber {
                line,
                field: "MaxAttempts",
                value: attempts.to_string(),
            })?;

        rules.push(Rule {
            line,
            state,
            value,
            destination,
            wait_seconds,
            max_attempts,
        });
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_is_deterministic() {
        let text = "A x B 0 0\nB y A 5 3";
        let first = TransitionTable::compile(text).unwrap();
        let second = TransitionTable::compile(text).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.entries(), second.entries());
        assert_eq!(first.start_state(), "A");

        let t = first.lookup("B", "y").unwrap();
        assert_eq!(t.destination, Destination::State("A".to_string()));
        assert_eq!(t.wait_seconds, 5);
        assert_eq!(t.max_attempts, 3);
    }

    #[test]
    fn test_comments_and_whitespace() {
        let text = "
            # Backup workflow
            start    *      copy       0   0   # kick off
            copy     done   @complete  0   0
            copy     wait   copy      30  10

            copy     failed @user_error 0 0
        ";
        let table = TransitionTable::compile(text).unwrap();
        assert_eq!(table.start_state(), "start");
        assert_eq!(table.entries().len(), 4);
        assert!(table.warnings().is_empty());
        assert_eq!(
            table.lookup("copy", "done").unwrap().destination,
            Destination::Terminal(Terminal::Complete)
        );
    }

    #[test]
    fn test_default_transition_lookup() {
        let table = TransitionTable::compile("A * B 0 0\nA retry A 10 0\nB go @complete 0 0").unwrap();

        assert_eq!(
            table.lookup("A", "").unwrap().destination,
            Destination::State("B".to_string())
        );
        // A single rule serves an empty value
        assert_eq!(
            table.lookup("B", "").unwrap().destination,
            Destination::Terminal(Terminal::Complete)
        );
        // Non-empty values never fall back
        assert!(matches!(
            table.lookup("A", "bogus"),
            Err(EngineError::UnmatchedTransition { .. })
        ));
        assert!(matches!(
            table.lookup("Z", "x"),
            Err(EngineError::UnknownState { .. })
        ));
    }

    #[test]
    fn test_compile_errors_carry_line_numbers() {
        assert_eq!(TransitionTable::compile("# nothing\n\n"), Err(CompileError::Empty));
        assert_eq!(
            TransitionTable::compile("A x B 0 0\nB y A 5"),
            Err(CompileError::FieldCount { line: 2, found: 4 })
        );
        assert!(matches!(
            TransitionTable::compile("A x B ten 0\nB y A 0 0"),
            Err(CompileError::InvalidNumber { line: 1, .. })
        ));
        assert!(matches!(
            TransitionTable::compile("A x B -1 0\nB y A 0 0"),
            Err(CompileError::InvalidNumber { line: 1, .. })
        ));
        assert!(matches!(
            TransitionTable::compile("A x B 0 0\nA x @complete 0 0\nB y A 0 0"),
            Err(CompileError::DuplicateTransition { line: 2, .. })
        ));
        assert!(matches!(
            TransitionTable::compile("A x C 0 0"),
            Err(CompileError::UndefinedState { line: 1, .. })
        ));
        assert!(matches!(
            TransitionTable::compile("A x @done 0 0"),
            Err(CompileError::UnknownTerminal { line: 1, .. })
        ));
        assert!(matches!(
            TransitionTable::compile("@A x @complete 0 0"),
            Err(CompileError::ReservedState { line: 1, .. })
        ));
    }

    #[test]
    fn test_reachability_warnings() {
        let table = TransitionTable::compile(
            "A go @complete 0 0\nB go A 0 0\nC loop D 0 0\nD loop C 0 0",
        )
        .unwrap();

        let warnings = table.warnings();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("'B' is unreachable"));

        let looping = TransitionTable::compile("A go B 0 0\nB go A 0 0").unwrap();
        assert_eq!(looping.warnings().len(), 2);
        assert!(looping.warnings()[0].contains("never reach a terminal"));
    }
}
