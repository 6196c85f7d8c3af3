//! Option matrix expansion
//!
//! An [`OptionSpec`] is the ordered option list of one setting. Expanding it
//! produces the argument matrix: one row per parameter combination, one column
//! per token. Earlier sweeps vary slowest, so the rows read like nested loops.

use crate::config::OptionToken;
use crate::sweep::{SweepError, SweepParameter};
use thiserror::Error;

/// Error type for option spec construction and expansion
#[derive(Debug, Error, PartialEq)]
pub enum MatrixError {
    #[error("invalid sweep in option group {group}, token {index}: {source}")]
    Sweep {
        group: usize,
        index: usize,
        #[source]
        source: SweepError,
    },

    #[error("option group {group}, token {index} must be a string or a sweep table, found {found}")]
    InvalidToken {
        group: usize,
        index: usize,
        found: String,
    },

    #[error("sweep position {position} out of range ({count} sweeps defined)")]
    SweepOutOfRange { position: usize, count: usize },
}

/// One command line token before expansion
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Literal(String),
    Sweep(SweepParameter),
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Token::Literal(value.to_string())
    }
}

impl From<SweepParameter> for Token {
    fn from(value: SweepParameter) -> Self {
        Token::Sweep(value)
    }
}

/// Where each sweep sits in the flattened token list
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SweepLocations {
    /// The literal token right before each sweep, if any
    pub preceding: Vec<Option<String>>,
    /// Column index of each sweep
    pub positions: Vec<usize>,
}

/// Ordered option groups of one setting
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OptionSpec {
    groups: Vec<Vec<Token>>,
}

impl OptionSpec {
    pub fn new(groups: Vec<Vec<Token>>) -> Self {
        Self { groups }
    }

    /// Convert experiment file tokens, rejecting anything that is neither a
    /// string nor a well-formed sweep table.
    pub fn from_config(groups: &[Vec<OptionToken>]) -> Result<Self, MatrixError> {
        let mut converted = Vec::with_capacity(groups.len());
        for (group_idx, group) in groups.iter().enumerate() {
            let mut tokens = Vec::with_capacity(group.len());
            for (index, token) in group.iter().enumerate() {
                let token = match token {
                    OptionToken::Literal(text) => Token::Literal(text.clone()),
                    OptionToken::Sweep(spec) => Token::Sweep(
                        SweepParameter::from_spec(spec).map_err(|source| MatrixError::Sweep {
                            group: group_idx,
                            index,
                            source,
                        })?,
                    ),
                    OptionToken::Invalid(value) => {
                        return Err(MatrixError::InvalidToken {
                            group: group_idx,
                            index,
                            found: value.to_string(),
                        })
                    }
                };
                tokens.push(token);
            }
            converted.push(tokens);
        }
        Ok(Self::new(converted))
    }

    pub fn groups(&self) -> &[Vec<Token>] {
        &self.groups
    }

    /// Tokens of every group in declared order
    pub fn flatten(&self) -> Vec<&Token> {
        self.groups.iter().flatten().collect()
    }

    /// Sweeps in declared order
    pub fn sweeps(&self) -> Vec<&SweepParameter> {
        self.flatten()
            .into_iter()
            .filter_map(|token| match token {
                Token::Sweep(sweep) => Some(sweep),
                Token::Literal(_) => None,
            })
            .collect()
    }

    pub fn locate_sweeps(&self) -> SweepLocations {
        let mut locations = SweepLocations::default();
        let mut previous: Option<&str> = None;
        for (position, token) in self.flatten().into_iter().enumerate() {
            match token {
                Token::Literal(text) => previous = Some(text),
                Token::Sweep(_) => {
                    locations.preceding.push(previous.map(str::to_string));
                    locations.positions.push(position);
                    previous = None;
                }
            }
        }
        locations
    }

    /// Full cross product of every sweep
    pub fn expand(&self) -> Vec<Vec<String>> {
        self.build(|_, sweep| sweep.values())
    }

    /// First and last value of each numeric sweep, lists unchanged
    pub fn expand_edges(&self) -> Vec<Vec<String>> {
        self.build(|_, sweep| sweep.edge_values())
    }

    /// Hold every sweep at its first value except `target`, which
    /// contributes its edge values.
    pub fn expand_varying(&self, target: usize) -> Result<Vec<Vec<String>>, MatrixError> {
        let count = self.sweeps().len();
        if target >= count {
            return Err(MatrixError::SweepOutOfRange {
                position: target,
                count,
            });
        }
        Ok(self.build(|idx, sweep| {
            if idx == target {
                sweep.edge_values()
            } else {
                vec![sweep.first_value()]
            }
        }))
    }

    /// Number of rows `expand` produces
    pub fn combinations(&self) -> usize {
        self.sweeps().iter().map(|s| s.len()).product()
    }

    /// An empty spec yields a single empty row: one invocation without options.
    fn build<F>(&self, mut values_of: F) -> Vec<Vec<String>>
    where
        F: FnMut(usize, &SweepParameter) -> Vec<String>,
    {
        let mut rows: Vec<Vec<String>> = vec![Vec::new()];
        let mut sweep_idx = 0;
        for token in self.flatten() {
            match token {
                Token::Literal(text) => {
                    for row in &mut rows {
                        row.push(text.clone());
                    }
                }
                Token::Sweep(sweep) => {
                    let values = values_of(sweep_idx, sweep);
                    sweep_idx += 1;
                    let mut grown = Vec::with_capacity(rows.len() * values.len());
                    for row in &rows {
                        for value in &values {
                            let mut next = row.clone();
                            next.push(value.clone());
                            grown.push(next);
                        }
                    }
                    rows = grown;
                }
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SweepSpec};
    use crate::sweep::SweepMode;
    use proptest::prelude::*;

    fn add(start: f64, stop: f64, step: f64) -> Token {
        Token::Sweep(SweepParameter::numeric(SweepMode::Add, start, Some(stop), Some(step)).unwrap())
    }

    fn list(values: &[&str]) -> Token {
        Token::Sweep(SweepParameter::list(values.iter().copied()).unwrap())
    }

    fn sample_spec() -> OptionSpec {
        OptionSpec::new(vec![
            vec!["-c:v".into(), "libx264".into()],
            vec!["-crf".into(), add(20.0, 30.0, 5.0)],
            vec!["-preset".into(), list(&["fast", "slow"])],
        ])
    }

    #[test]
    fn test_expand_nested_loop_order() {
        let rows = sample_spec().expand();
        let expected: Vec<Vec<&str>> = vec![
            vec!["-c:v", "libx264", "-crf", "20", "-preset", "fast"],
            vec!["-c:v", "libx264", "-crf", "20", "-preset", "slow"],
            vec!["-c:v", "libx264", "-crf", "25", "-preset", "fast"],
            vec!["-c:v", "libx264", "-crf", "25", "-preset", "slow"],
            vec!["-c:v", "libx264", "-crf", "30", "-preset", "fast"],
            vec!["-c:v", "libx264", "-crf", "30", "-preset", "slow"],
        ];
        assert_eq!(rows, expected);
    }

    #[test]
    fn test_sweep_as_first_token_seeds_rows() {
        let spec = OptionSpec::new(vec![vec![list(&["a", "b"]), "-x".into()]]);
        assert_eq!(spec.expand(), vec![vec!["a", "-x"], vec!["b", "-x"]]);
    }

    #[test]
    fn test_empty_spec_yields_single_empty_row() {
        assert_eq!(OptionSpec::default().expand(), vec![Vec::<String>::new()]);
    }

    #[test]
    fn test_expand_edges() {
        let spec = OptionSpec::new(vec![
            vec!["-crf".into(), add(10.0, 40.0, 5.0)],
            vec!["-preset".into(), list(&["a", "b", "c"])],
        ]);
        let rows = spec.expand_edges();
        assert_eq!(rows.len(), 2 * 3);
        assert_eq!(rows[0], vec!["-crf", "10", "-preset", "a"]);
        assert_eq!(rows[5], vec!["-crf", "40", "-preset", "c"]);
    }

    #[test]
    fn test_expand_varying_holds_other_sweeps() {
        let spec = OptionSpec::new(vec![
            vec!["-crf".into(), add(10.0, 40.0, 5.0)],
            vec!["-g".into(), add(1.0, 4.0, 1.0)],
        ]);
        let rows = spec.expand_varying(1).unwrap();
        assert_eq!(
            rows,
            vec![vec!["-crf", "10", "-g", "1"], vec!["-crf", "10", "-g", "4"]]
        );
        assert_eq!(
            spec.expand_varying(2),
            Err(MatrixError::SweepOutOfRange {
                position: 2,
                count: 2
            })
        );
    }

    #[test]
    fn test_locate_sweeps() {
        let spec = OptionSpec::new(vec![
            vec![list(&["x"])],
            vec!["-crf".into(), add(1.0, 2.0, 1.0)],
            vec!["-tune".into(), "film".into(), list(&["a"])],
        ]);
        let locations = spec.locate_sweeps();
        assert_eq!(
            locations.preceding,
            vec![None, Some("-crf".to_string()), Some("film".to_string())]
        );
        assert_eq!(locations.positions, vec![0, 2, 5]);
    }

    #[test]
    fn test_from_config_rejects_invalid_token() {
        let toml_str = r#"
[[settings]]
name = "bad"
backend = "ffmpeg"
binary = "ffmpeg"
options = [["-c:v", "libx264"], ["-crf", 23]]
"#;
        let config = Config::parse_toml(toml_str).unwrap();
        let err = OptionSpec::from_config(&config.settings[0].options).unwrap_err();
        assert!(matches!(
            err,
            MatrixError::InvalidToken {
                group: 1,
                index: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_from_config_reports_malformed_sweep() {
        let groups = vec![vec![OptionToken::Sweep(SweepSpec {
            mode: "add".to_string(),
            start: Some(1.0),
            stop: None,
            step: Some(1.0),
            values: None,
            prefix: String::new(),
            suffix: String::new(),
            separate: false,
            precision: None,
        })]];
        let err = OptionSpec::from_config(&groups).unwrap_err();
        assert!(matches!(err, MatrixError::Sweep { group: 0, index: 0, .. }));
    }

    fn arb_spec() -> impl Strategy<Value = OptionSpec> {
        let token = prop_oneof![
            "[a-z-]{1,6}".prop_map(Token::Literal),
            (0i64..20, 1i64..6, 1i64..4).prop_map(|(start, span, step)| {
                add(start as f64, (start + span) as f64, step as f64)
            }),
            proptest::collection::vec("[a-z]{1,4}", 1..4).prop_map(|values| {
                Token::Sweep(SweepParameter::list(values).unwrap())
            }),
        ];
        proptest::collection::vec(proptest::collection::vec(token, 1..4), 0..4)
            .prop_map(OptionSpec::new)
    }

    // **Property: Matrix Cardinality**
    //
    // *For any* option spec, `expand` yields the product of the sweep sizes as
    // row count, every row as long as the flattened token list, and literal
    // columns identical across rows.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_expand_cardinality(spec in arb_spec()) {
            let rows = spec.expand();
            let width = spec.flatten().len();

            prop_assert_eq!(rows.len(), spec.combinations());
            prop_assert!(rows.iter().all(|row| row.len() == width));

            for (col, token) in spec.flatten().into_iter().enumerate() {
                if let Token::Literal(text) = token {
                    prop_assert!(rows.iter().all(|row| &row[col] == text));
                }
            }
        }

        // **Property: Edge Reduction**
        //
        // *For any* option spec, each numeric sweep column of `expand_edges` holds
        // at most two distinct values, which are its first and last value.
        #[test]
        fn prop_edges_keep_first_and_last(spec in arb_spec()) {
            let rows = spec.expand_edges();
            let locations = spec.locate_sweeps();

            for (sweep, col) in spec.sweeps().iter().zip(locations.positions) {
                let mut seen: Vec<&String> = rows.iter().map(|row| &row[col]).collect();
                seen.sort();
                seen.dedup();
                let all = sweep.values();
                if sweep.mode() == SweepMode::List {
                    prop_assert_eq!(seen.len(), {
                        let mut distinct = all.clone();
                        distinct.sort();
                        distinct.dedup();
                        distinct.len()
                    });
                } else {
                    let expected = if all.len() >= 2 { 2 } else { 1 };
                    prop_assert_eq!(seen.len(), expected);
                    prop_assert!(seen.contains(&&all[0]));
                    prop_assert!(seen.contains(&&all[all.len() - 1]));
                }
            }
        }
    }
}
