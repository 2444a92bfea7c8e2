//! # Model Formulas
//!
//! A formula names the outcome(s), the regressors, the fixed effects and, for
//! IV models, the endogenous regressors and their instruments:
//!
//! ```text
//! Y1 + Y2 ~ X1 + csw0(X2, X3) | f1 + f2^f3 | D ~ Z1 + Z2
//! ```
//!
//! Regressors and fixed effects are plain column names. One stepwise operator
//! per part expands a single formula into several models:
//!
//! - `sw(a, b)`: `[a]`, `[b]`
//! - `sw0(a, b)`: `[]`, `[a]`, `[b]`
//! - `csw(a, b)`: `[a]`, `[a, b]`
//! - `csw0(a, b)`: `[]`, `[a]`, `[a, b]`
//!
//! Models are produced with the fixed-effect step outermost, then the
//! outcome, then the regressor step.

use crate::fixef::FixedEffectTerm;
use crate::model::{ModelFamily, ModelSpec};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormulaError {
    #[error("Formula '{0}' has no '~' separating the outcome from the regressors.")]
    MissingTilde(String),

    #[error("Formula '{formula}' has an empty {part}.")]
    EmptyPart { part: &'static str, formula: String },

    #[error(
        "Term '{0}' is not supported. Only column names, '1', '0' and the stepwise operators sw, sw0, csw, csw0 are accepted."
    )]
    UnsupportedTerm(String),

    #[error("Formula part '{0}' uses more than one stepwise operator.")]
    MultipleSteps(String),

    #[error("Formula '{0}' has more than one instrumental-variable part or too many '|' separators.")]
    TooManyParts(String),

    #[error("Unbalanced parentheses in '{0}'.")]
    Unbalanced(String),
}

/// The four multiple-estimation operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Sw,
    Sw0,
    Csw,
    Csw0,
}

impl StepKind {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "sw" => Some(StepKind::Sw),
            "sw0" => Some(StepKind::Sw0),
            "csw" => Some(StepKind::Csw),
            "csw0" => Some(StepKind::Csw0),
            _ => None,
        }
    }

    /// The selections of `args` this operator produces, in order.
    pub fn expand<T: Clone>(self, args: &[T]) -> Vec<Vec<T>> {
        let mut steps = Vec::new();
        if matches!(self, StepKind::Sw0 | StepKind::Csw0) {
            steps.push(Vec::new());
        }
        match self {
            StepKind::Sw | StepKind::Sw0 => {
                steps.extend(args.iter().map(|a| vec![a.clone()]));
            }
            StepKind::Csw | StepKind::Csw0 => {
                steps.extend((1..=args.len()).map(|n| args[..n].to_vec()));
            }
        }
        steps
    }
}

/// A position in a formula part: one fixed item or a stepwise operator.
#[derive(Debug, Clone, PartialEq)]
enum Slot<T> {
    Item(T),
    Step(StepKind, Vec<T>),
}

/// All selections of a part, with stepped items spliced in at the operator's
/// position. A part without operator yields exactly one selection.
fn expand_slots<T: Clone>(slots: &[Slot<T>]) -> Vec<Vec<T>> {
    let step = slots.iter().find_map(|slot| match slot {
        Slot::Step(kind, args) => Some(kind.expand(args)),
        Slot::Item(_) => None,
    });
    let choices = step.unwrap_or_else(|| vec![Vec::new()]);
    choices
        .into_iter()
        .map(|chosen| {
            let mut items = Vec::new();
            for slot in slots {
                match slot {
                    Slot::Item(item) => items.push(item.clone()),
                    Slot::Step(..) => items.extend(chosen.iter().cloned()),
                }
            }
            items
        })
        .collect()
}

/// A parsed, not yet expanded formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    text: String,
    depvars: Vec<String>,
    regressors: Vec<Slot<String>>,
    /// `Some(false)` for an explicit `0`/`-1`, `Some(true)` for an explicit `1`.
    intercept: Option<bool>,
    fixed_effects: Vec<Slot<FixedEffectTerm>>,
    endogenous: Vec<String>,
    instruments: Vec<String>,
}

/// Splits on `sep` outside parentheses.
fn split_top_level(text: &str, sep: char) -> Result<Vec<&str>, FormulaError> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(FormulaError::Unbalanced(text.to_string()));
                }
            }
            c if c == sep && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(FormulaError::Unbalanced(text.to_string()));
    }
    parts.push(&text[start..]);
    Ok(parts)
}

fn is_column_name(term: &str) -> bool {
    !term.is_empty()
        && term
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.'))
}

fn parse_name(term: &str) -> Result<String, FormulaError> {
    if is_column_name(term) {
        Ok(term.to_string())
    } else {
        Err(FormulaError::UnsupportedTerm(term.to_string()))
    }
}

fn parse_fixef(term: &str) -> Result<FixedEffectTerm, FormulaError> {
    match term.parse::<FixedEffectTerm>() {
        Ok(parsed) if parsed.columns().iter().all(|c| is_column_name(c)) => Ok(parsed),
        _ => Err(FormulaError::UnsupportedTerm(term.to_string())),
    }
}

/// Parses `name(args)` if `term` is a stepwise operator call.
fn parse_step<T>(
    term: &str,
    item: impl Fn(&str) -> Result<T, FormulaError>,
) -> Result<Option<Slot<T>>, FormulaError> {
    let Some(open) = term.find('(') else {
        return Ok(None);
    };
    let Some(kind) = StepKind::parse(term[..open].trim()) else {
        return Err(FormulaError::UnsupportedTerm(term.to_string()));
    };
    let inner = term[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| FormulaError::Unbalanced(term.to_string()))?;
    let args = split_top_level(inner, ',')?
        .into_iter()
        .map(|arg| item(arg.trim()))
        .collect::<Result<Vec<T>, _>>()?;
    Ok(Some(Slot::Step(kind, args)))
}

fn parse_slots<T>(
    part: &str,
    item: impl Fn(&str) -> Result<T, FormulaError> + Copy,
) -> Result<Vec<Slot<T>>, FormulaError> {
    let mut slots = Vec::new();
    for term in split_top_level(part, '+')? {
        let term = term.trim();
        match parse_step(term, item)? {
            Some(step) => slots.push(step),
            None => slots.push(Slot::Item(item(term)?)),
        }
    }
    if slots.iter().filter(|s| matches!(s, Slot::Step(..))).count() > 1 {
        return Err(FormulaError::MultipleSteps(part.trim().to_string()));
    }
    Ok(slots)
}

fn parse_names(part: &str) -> Result<Vec<String>, FormulaError> {
    split_top_level(part, '+')?
        .into_iter()
        .map(|term| parse_name(term.trim()))
        .collect()
}

impl FromStr for Formula {
    type Err = FormulaError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let parts = split_top_level(text, '|')?;
        let (lhs, rhs) = parts[0]
            .split_once('~')
            .ok_or_else(|| FormulaError::MissingTilde(text.to_string()))?;
        let empty = |part: &'static str| FormulaError::EmptyPart {
            part,
            formula: text.to_string(),
        };

        if lhs.trim().is_empty() {
            return Err(empty("outcome"));
        }
        let depvars = parse_names(lhs)?;

        let mut intercept = None;
        let mut rhs_terms = Vec::new();
        for term in split_top_level(rhs, '+')? {
            match term.trim() {
                "1" => intercept = Some(true),
                "0" | "-1" => intercept = Some(false),
                "" => return Err(empty("regressor list")),
                other => rhs_terms.push(other),
            }
        }
        let regressors = if rhs_terms.is_empty() {
            Vec::new()
        } else {
            parse_slots(&rhs_terms.join("+"), parse_name)?
        };

        let mut fixed_effects = Vec::new();
        let mut endogenous = Vec::new();
        let mut instruments = Vec::new();
        let mut seen_fixef = false;
        for part in &parts[1..] {
            if let Some((endog, instr)) = part.split_once('~') {
                if !endogenous.is_empty() {
                    return Err(FormulaError::TooManyParts(text.to_string()));
                }
                endogenous = parse_names(endog)?;
                instruments = parse_names(instr)?;
            } else {
                if seen_fixef || !endogenous.is_empty() {
                    return Err(FormulaError::TooManyParts(text.to_string()));
                }
                seen_fixef = true;
                if part.trim() != "0" {
                    if part.trim().is_empty() {
                        return Err(empty("fixed-effect list"));
                    }
                    fixed_effects = parse_slots(part, parse_fixef)?;
                }
            }
        }

        Ok(Formula {
            text: text.trim().to_string(),
            depvars,
            regressors,
            intercept,
            fixed_effects,
            endogenous,
            instruments,
        })
    }
}

impl Formula {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_iv(&self) -> bool {
        !self.endogenous.is_empty()
    }

    pub fn endogenous(&self) -> &[String] {
        &self.endogenous
    }

    pub fn instruments(&self) -> &[String] {
        &self.instruments
    }

    /// Expands every stepwise operator and outcome into one spec per model.
    ///
    /// Models with fixed effects never carry an intercept; models without get
    /// one unless the formula says `0` or `drop_intercept` is set.
    pub fn expand(&self, family: ModelFamily, drop_intercept: bool) -> Vec<ModelSpec> {
        let family = if self.is_iv() { ModelFamily::Iv } else { family };
        let mut specs = Vec::new();
        for fixed_effects in expand_slots(&self.fixed_effects) {
            for depvar in &self.depvars {
                for regressors in expand_slots(&self.regressors) {
                    let intercept = fixed_effects.is_empty()
                        && !drop_intercept
                        && self.intercept.unwrap_or(true);
                    specs.push(ModelSpec {
                        depvar: depvar.clone(),
                        regressors,
                        fixed_effects: fixed_effects.clone(),
                        endogenous: self.endogenous.clone(),
                        instruments: self.instruments.clone(),
                        family,
                        intercept,
                    });
                }
            }
        }
        specs
    }
}
