//! Rule table: how compound names map to categories, and how a rule turns a
//! tuple of reactant names into concrete reactions.
//!
//! Every behaviour is a closed enum dispatched by `match`; a rule is the
//! combination of a reactant pattern (one [`Category`] per slot), a
//! [`ProductBuilder`], a [`Kinetic`] constant builder, a [`VariantPolicy`]
//! and a [`RateFunction`].

use std::collections::BTreeMap;
use std::str::FromStr;

use meval::{Context, ContextProvider, Expr};
use serde::{Deserialize, Serialize};

use crate::WorkerContext;
use crate::error::SimError;

/// Gas constant used by [`Kinetic::Arrhenius`], in J/(mol·K).
const GAS_CONSTANT: f64 = 8.314;

pub type RuleId = usize;
pub type CategoryId = usize;

/// Reaction variant (e.g. a cut position); `None` for rules without variants.
pub type Variant = Option<i64>;

pub fn is_polymer(name: &str) -> bool {
    !name.is_empty() && name.chars().all(char::is_alphabetic)
}

pub fn is_active(name: &str) -> bool {
    name.strip_suffix('*').is_some_and(is_polymer)
}

/// Number of monomer units in a (possibly activated) polymer, 0 otherwise.
pub fn polymer_length(name: &str) -> usize {
    if is_polymer(name) {
        name.chars().count()
    } else if is_active(name) {
        name.chars().count() - 1
    } else {
        0
    }
}

/// Count of upper-case minus count of lower-case letters.
pub fn asymmetry(name: &str) -> i64 {
    name.chars().fold(0, |acc, ch| {
        if ch.is_uppercase() {
            acc + 1
        } else if ch.is_lowercase() {
            acc - 1
        } else {
            acc
        }
    })
}

fn same_case(one: char, two: char) -> bool {
    (one.is_lowercase() && two.is_lowercase()) || (one.is_uppercase() && two.is_uppercase())
}

fn split_at_char(name: &str, position: usize) -> (&str, &str) {
    let byte = name
        .char_indices()
        .nth(position)
        .map(|(idx, _)| idx)
        .unwrap_or(name.len());
    name.split_at(byte)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Polymer,
    Monomer,
    LongPolymer,
    Active,
    ActiveMonomer,
    RightHanded,
    LeftHanded,
    Exact(String),
}

impl Category {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Category::Polymer => is_polymer(name),
            Category::Monomer => is_polymer(name) && name.chars().count() == 1,
            Category::LongPolymer => is_polymer(name) && name.chars().count() > 1,
            Category::Active => is_active(name),
            Category::ActiveMonomer => is_active(name) && name.chars().count() == 2,
            Category::RightHanded => asymmetry(name) > 0,
            Category::LeftHanded => asymmetry(name) < 0,
            Category::Exact(exact) => exact == name,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductBuilder {
    /// Explicit product list, independent of the reactants.
    Fixed(Vec<String>),
    /// Concatenates the reactant names with a separator.
    Join(String),
    /// Splits the first reactant on a separator.
    Split(String),
    /// Cuts the first reactant in two at the variant position.
    Cut,
    Activate,
    Deactivate,
    /// Drops the activation mark of the first reactant and appends the second.
    ActivePolymerize,
    /// Swaps the case of the monomer at the variant position.
    Epimerize,
}

impl ProductBuilder {
    pub fn build(&self, reactants: &[&str], variant: Variant) -> Vec<String> {
        let first = reactants.first().copied().unwrap_or("");
        let position = variant.unwrap_or(0).max(0) as usize;
        match self {
            ProductBuilder::Fixed(names) => names.clone(),
            ProductBuilder::Join(sep) => vec![reactants.join(sep)],
            ProductBuilder::Split(sep) => first.split(sep.as_str()).map(String::from).collect(),
            ProductBuilder::Cut => {
                let (head, tail) = split_at_char(first, position);
                vec![head.to_string(), tail.to_string()]
            }
            ProductBuilder::Activate => vec![format!("{first}*")],
            ProductBuilder::Deactivate => {
                vec![first.strip_suffix('*').unwrap_or(first).to_string()]
            }
            ProductBuilder::ActivePolymerize => {
                let second = reactants.get(1).copied().unwrap_or("");
                let stem = first.strip_suffix('*').unwrap_or(first);
                vec![format!("{stem}{second}")]
            }
            ProductBuilder::Epimerize => vec![
                first
                    .chars()
                    .enumerate()
                    .map(|(idx, ch)| {
                        if idx != position {
                            ch.to_string()
                        } else if ch.is_uppercase() {
                            ch.to_lowercase().to_string()
                        } else {
                            ch.to_uppercase().to_string()
                        }
                    })
                    .collect(),
            ],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Length of the first reactant equals the given value.
    FirstLength(usize),
    VariantEquals(i64),
    /// Monomers on both sides of the cut position share their case.
    SameCaseAtCut,
    /// Last monomer of the (active) first reactant and first monomer of the
    /// second reactant share their case.
    SameCaseAtJunction,
}

impl Condition {
    fn holds(&self, reactants: &[&str], variant: Variant) -> bool {
        let first = reactants.first().copied().unwrap_or("");
        match self {
            Condition::FirstLength(length) => polymer_length(first) == *length,
            Condition::VariantEquals(value) => variant == Some(*value),
            Condition::SameCaseAtCut => {
                let position = variant.unwrap_or(0);
                if position < 1 {
                    return false;
                }
                let mut chars = first.chars().skip(position as usize - 1);
                match (chars.next(), chars.next()) {
                    (Some(before), Some(after)) => same_case(before, after),
                    _ => false,
                }
            }
            Condition::SameCaseAtJunction => {
                let stem = first.strip_suffix('*').unwrap_or(first);
                let last = stem.chars().last();
                let next = reactants.get(1).and_then(|name| name.chars().next());
                match (last, next) {
                    (Some(last), Some(next)) => same_case(last, next),
                    _ => false,
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kinetic {
    Param(String),
    Value(f64),
    /// `k0 * exp(-eact / (R * T))`
    Arrhenius { k0: String, eact: String },
    /// Linear sweep from `start` to `end` across the worker ranks of a pool.
    WorkerSweep { start: String, end: String },
    Alternate {
        condition: Condition,
        if_true: Box<Kinetic>,
        if_false: Box<Kinetic>,
    },
}

impl Kinetic {
    fn check(&self, params: &Parameters) -> Result<(), SimError> {
        let require = |name: &String| {
            if params.contains(name) {
                Ok(())
            } else {
                Err(SimError::invalid(format!("unknown kinetic parameter '{name}'")))
            }
        };
        match self {
            Kinetic::Param(name) => require(name),
            Kinetic::Value(value) => {
                if value.is_finite() && *value >= 0.0 {
                    Ok(())
                } else {
                    Err(SimError::invalid(format!(
                        "kinetic constant {value} must be finite and non-negative"
                    )))
                }
            }
            Kinetic::Arrhenius { k0, eact } => require(k0).and(require(eact)),
            Kinetic::WorkerSweep { start, end } => require(start).and(require(end)),
            Kinetic::Alternate {
                if_true, if_false, ..
            } => {
                if_true.check(params)?;
                if_false.check(params)
            }
        }
    }

    pub fn constant(&self, reactants: &[&str], variant: Variant, params: &Parameters) -> f64 {
        match self {
            Kinetic::Param(name) => params.get(name),
            Kinetic::Value(value) => *value,
            Kinetic::Arrhenius { k0, eact } => {
                params.get(k0) * (-params.get(eact) / GAS_CONSTANT / params.get("T")).exp()
            }
            Kinetic::WorkerSweep { start, end } => {
                let (start, end) = (params.get(start), params.get(end));
                let size = params.get("ntot");
                if size <= 1.0 {
                    start
                } else {
                    start + (end - start) * params.get("num") / (size - 1.0)
                }
            }
            Kinetic::Alternate {
                condition,
                if_true,
                if_false,
            } => {
                if condition.holds(reactants, variant) {
                    if_true.constant(reactants, variant, params)
                } else {
                    if_false.constant(reactants, variant, params)
                }
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantPolicy {
    #[default]
    None,
    Single(i64),
    /// Every interior cut point of the first reactant, `1..length`.
    Interior,
    /// Every monomer position of the first reactant, `0..length`.
    Positions,
    /// `first_offset..length(reactants[reactant]) + last_offset`.
    Range {
        first_offset: i64,
        last_offset: i64,
        reactant: usize,
    },
}

impl VariantPolicy {
    pub fn variants(&self, reactants: &[&str]) -> Vec<Variant> {
        let length_of = |idx: usize| {
            reactants
                .get(idx)
                .map(|name| polymer_length(name) as i64)
                .unwrap_or(0)
        };
        match self {
            VariantPolicy::None => vec![None],
            VariantPolicy::Single(value) => vec![Some(*value)],
            VariantPolicy::Interior => (1..length_of(0)).map(Some).collect(),
            VariantPolicy::Positions => (0..length_of(0)).map(Some).collect(),
            VariantPolicy::Range {
                first_offset,
                last_offset,
                reactant,
            } => (*first_offset..length_of(*reactant) + last_offset)
                .map(Some)
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateFunction {
    #[default]
    MassAction,
    /// `k * x^n / (K^n + x^n)` over the population `x` of one reactant slot.
    Hill {
        reactant: usize,
        hill_n: f64,
        k_half: f64,
    },
    /// `k * x / (k_m + x)` over the population `x` of one reactant slot.
    MichaelisMenten { reactant: usize, k_m: f64 },
    /// Free-form expression over `k`, `v` and `x0..xN`.
    Expression(String),
}

#[derive(Clone, Debug)]
pub(crate) enum RateKind {
    MassAction,
    Hill {
        reactant: usize,
        hill_n: f64,
        k_half_pow_n: f64,
    },
    MichaelisMenten {
        reactant: usize,
        k_m: f64,
    },
    Expression(Expr),
}

struct ReactantContext<'a> {
    constant: f64,
    volume: f64,
    populations: &'a [u64],
}

fn parse_reactant_variable(name: &str) -> Option<usize> {
    let digits = name.strip_prefix('x')?;
    if digits.is_empty() {
        return None;
    }
    digits.parse::<usize>().ok()
}

impl<'a> ContextProvider for ReactantContext<'a> {
    fn get_var(&self, name: &str) -> Option<f64> {
        match name {
            "k" => Some(self.constant),
            "v" => Some(self.volume),
            _ => parse_reactant_variable(name)
                .and_then(|idx| self.populations.get(idx))
                .map(|&pop| pop as f64),
        }
    }
}

fn collect_reactant_refs(expr_str: &str, n_slots: usize) -> Result<Vec<usize>, SimError> {
    let mut refs = Vec::new();
    let bytes = expr_str.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        let starts_token = idx == 0 || !bytes[idx - 1].is_ascii_alphanumeric();
        if bytes[idx] == b'x' && starts_token {
            let mut end = idx + 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > idx + 1 {
                let digits = &expr_str[idx + 1..end];
                let slot = digits.parse::<usize>().map_err(|_| {
                    SimError::invalid(format!("invalid reactant reference 'x{digits}'"))
                })?;
                if slot >= n_slots {
                    return Err(SimError::invalid(format!(
                        "expression '{expr_str}' refers to reactant x{slot} \
                         but the rule has {n_slots} reactants"
                    )));
                }
                if !refs.contains(&slot) {
                    refs.push(slot);
                }
                idx = end;
                continue;
            }
        }
        idx += 1;
    }
    Ok(refs)
}

impl RateKind {
    fn compile(rate: &RateFunction, n_slots: usize) -> Result<Self, SimError> {
        match rate {
            RateFunction::MassAction => Ok(RateKind::MassAction),
            RateFunction::Hill {
                reactant,
                hill_n,
                k_half,
            } => {
                if *reactant >= n_slots {
                    return Err(SimError::invalid(format!(
                        "Hill reactant index {reactant} exceeds rule arity {n_slots}"
                    )));
                }
                if *hill_n <= 0.0 || *k_half <= 0.0 {
                    return Err(SimError::invalid("Hill parameters must be positive"));
                }
                Ok(RateKind::Hill {
                    reactant: *reactant,
                    hill_n: *hill_n,
                    k_half_pow_n: k_half.powf(*hill_n),
                })
            }
            RateFunction::MichaelisMenten { reactant, k_m } => {
                if *reactant >= n_slots {
                    return Err(SimError::invalid(format!(
                        "Michaelis-Menten reactant index {reactant} exceeds rule arity {n_slots}"
                    )));
                }
                if *k_m <= 0.0 {
                    return Err(SimError::invalid("Michaelis-Menten k_m must be positive"));
                }
                Ok(RateKind::MichaelisMenten {
                    reactant: *reactant,
                    k_m: *k_m,
                })
            }
            RateFunction::Expression(expr_str) => {
                let expr = Expr::from_str(expr_str).map_err(|err| {
                    SimError::invalid(format!("expression '{expr_str}' parse error: {err}"))
                })?;
                collect_reactant_refs(expr_str, n_slots)?;
                let zeros = vec![0u64; n_slots];
                let ctx = (
                    ReactantContext {
                        constant: 1.0,
                        volume: 1.0,
                        populations: &zeros,
                    },
                    Context::new(),
                );
                expr.eval_with_context(ctx).map_err(|err| {
                    SimError::invalid(format!("expression '{expr_str}' cannot be evaluated: {err}"))
                })?;
                Ok(RateKind::Expression(expr))
            }
        }
    }

    /// Propensity from the stochastic constant, the populations of every
    /// reactant slot (in rule order) and the merged stoichiometry.
    ///
    /// Infeasible stoichiometry, non-finite and negative results are all
    /// reported as zero.
    #[inline]
    pub(crate) fn propensity(
        &self,
        constant: f64,
        volume: f64,
        slot_pops: &[u64],
        stoich_pops: &[(u64, u32)],
    ) -> f64 {
        // a reaction that would drive a reactant negative never fires,
        // whatever its rate law
        if stoich_pops
            .iter()
            .any(|&(available, count)| available < count as u64)
        {
            return 0.0;
        }
        let value = match self {
            RateKind::MassAction => stoich_pops
                .iter()
                .fold(constant, |acc, &(available, count)| {
                    acc * falling_factorial(available, count)
                }),
            RateKind::Hill {
                reactant,
                hill_n,
                k_half_pow_n,
            } => {
                let power = (slot_pops[*reactant] as f64).powf(*hill_n);
                let denom = k_half_pow_n + power;
                if denom == 0.0 {
                    0.0
                } else {
                    constant * power / denom
                }
            }
            RateKind::MichaelisMenten { reactant, k_m } => {
                let substrate = slot_pops[*reactant] as f64;
                constant * substrate / (k_m + substrate)
            }
            RateKind::Expression(expr) => {
                let ctx = (
                    ReactantContext {
                        constant,
                        volume,
                        populations: slot_pops,
                    },
                    Context::new(),
                );
                expr.eval_with_context(ctx).unwrap_or(0.0)
            }
        };
        if value.is_finite() && value > 0.0 {
            value
        } else {
            0.0
        }
    }

    pub(crate) fn is_mass_action(&self) -> bool {
        matches!(self, RateKind::MassAction)
    }
}

#[inline]
pub(crate) fn falling_factorial(value: u64, count: u32) -> f64 {
    match count {
        0 => 1.0,
        1 => value as f64,
        2 if value >= 2 => (value * (value - 1)) as f64,
        3 if value >= 3 => (value * (value - 1) * (value - 2)) as f64,
        _ if value < count as u64 => 0.0,
        _ => {
            let mut acc = 1.0;
            for i in 0..count as u64 {
                acc *= (value - i) as f64;
            }
            acc
        }
    }
}

fn factorial(count: u32) -> f64 {
    (2..=count as u64).map(|value| value as f64).product()
}

/// Merges repeated names into `(name, multiplicity)`, in order of first
/// appearance.
pub fn stoichiometry<S: AsRef<str>>(names: &[S]) -> Vec<(String, u32)> {
    let mut merged: Vec<(String, u32)> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.as_ref();
        match merged.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, count)) => *count += 1,
            None => merged.push((name.to_string(), 1)),
        }
    }
    merged
}

/// Named kinetic parameters, with the `T`, `pH`, `num` and `ntot` defaults.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Parameters {
    values: BTreeMap<String, f64>,
}

impl Parameters {
    pub fn new(values: &BTreeMap<String, f64>, context: WorkerContext) -> Self {
        let mut all = BTreeMap::new();
        all.insert("T".to_string(), 300.0);
        all.insert("pH".to_string(), 7.0);
        all.insert("num".to_string(), context.rank as f64);
        all.insert("ntot".to_string(), context.size as f64);
        for (key, value) in values {
            all.insert(key.clone(), *value);
        }
        Self { values: all }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get(&self, name: &str) -> f64 {
        self.values.get(name).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), value);
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self::new(&BTreeMap::new(), WorkerContext::single())
    }
}

/// Serialized description of a rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub reactants: Vec<Category>,
    pub products: ProductBuilder,
    pub constant: Kinetic,
    #[serde(default)]
    pub variants: VariantPolicy,
    #[serde(default)]
    pub rate: RateFunction,
    /// Robust rules compute their products once; others on every firing.
    #[serde(default = "default_robust")]
    pub robust: bool,
    #[serde(default)]
    pub descr: String,
}

fn default_robust() -> bool {
    true
}

#[derive(Clone, Debug)]
pub struct Rule {
    pub name: String,
    pub descr: String,
    pub reactants: Vec<CategoryId>,
    pub products: ProductBuilder,
    pub kinetic: Kinetic,
    pub variants: VariantPolicy,
    pub robust: bool,
    pub(crate) rate: RateKind,
}

impl Rule {
    pub fn build_products(
        &self,
        reactants: &[&str],
        variant: Variant,
    ) -> Result<Vec<(String, u32)>, SimError> {
        let products = self.products.build(reactants, variant);
        if products.iter().any(String::is_empty) {
            return Err(SimError::InvalidProduct {
                rule: self.name.clone(),
                reactants: reactants.iter().map(|name| name.to_string()).collect(),
            });
        }
        Ok(stoichiometry(&products))
    }

    /// Stochastic constant of the reaction built from `reactants`. For
    /// mass-action rules the macroscopic constant is divided by `m!` for each
    /// reactant of multiplicity `m` and by `volume^(order - 1)`.
    pub fn constant_for(
        &self,
        reactants: &[&str],
        variant: Variant,
        params: &Parameters,
        volume: f64,
    ) -> f64 {
        let mut constant = self.kinetic.constant(reactants, variant, params);
        if self.rate.is_mass_action() {
            let stoich = stoichiometry(reactants);
            let order: u32 = stoich.iter().map(|(_, count)| count).sum();
            for (_, count) in &stoich {
                if *count > 1 {
                    constant /= factorial(*count);
                }
            }
            if order > 1 {
                constant /= volume.powi(order as i32 - 1);
            }
        }
        constant
    }

    pub(crate) fn rate(&self) -> &RateKind {
        &self.rate
    }
}

#[derive(Clone, Debug, Default)]
pub struct Ruleset {
    categories: Vec<Category>,
    rules: Vec<Rule>,
    names: BTreeMap<String, RuleId>,
}

impl Ruleset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id]
    }

    pub fn rule_id(&self, name: &str) -> Option<RuleId> {
        self.names.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn intern(&mut self, category: &Category) -> CategoryId {
        match self.categories.iter().position(|known| known == category) {
            Some(id) => id,
            None => {
                self.categories.push(category.clone());
                self.categories.len() - 1
            }
        }
    }

    /// Categories `name` belongs to, in id order.
    pub fn categories_of(&self, name: &str) -> Vec<CategoryId> {
        self.categories
            .iter()
            .enumerate()
            .filter_map(|(id, category)| category.matches(name).then_some(id))
            .collect()
    }

    /// Validates and registers a rule.
    pub fn add_rule(
        &mut self,
        name: &str,
        spec: &RuleSpec,
        params: &Parameters,
    ) -> Result<RuleId, SimError> {
        if self.names.contains_key(name) {
            return Err(SimError::invalid(format!("rule '{name}' already defined")));
        }
        if spec.reactants.is_empty() {
            return Err(SimError::invalid(format!("rule '{name}' has no reactant")));
        }
        spec.constant.check(params)?;
        if let VariantPolicy::Range { reactant, .. } = spec.variants {
            if reactant >= spec.reactants.len() {
                return Err(SimError::invalid(format!(
                    "rule '{name}' variant range refers to reactant {reactant}"
                )));
            }
        }
        let rate = RateKind::compile(&spec.rate, spec.reactants.len())
            .map_err(|err| SimError::invalid(format!("rule '{name}': {err}")))?;
        let reactants = spec
            .reactants
            .iter()
            .map(|category| self.intern(category))
            .collect();
        let id = self.rules.len();
        self.rules.push(Rule {
            name: name.to_string(),
            descr: spec.descr.clone(),
            reactants,
            products: spec.products.clone(),
            kinetic: spec.constant.clone(),
            variants: spec.variants.clone(),
            robust: spec.robust,
            rate,
        });
        self.names.insert(name.to_string(), id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polymer_params() -> Parameters {
        let mut values = BTreeMap::new();
        values.insert("kp".to_string(), 2.0);
        values.insert("kh_same".to_string(), 1.0);
        values.insert("kh_diff".to_string(), 5.0);
        Parameters::new(&values, WorkerContext::single())
    }

    #[test]
    fn categories_classify_names() {
        assert!(Category::Polymer.matches("aBc"));
        assert!(!Category::Polymer.matches("a*"));
        assert!(Category::Monomer.matches("a"));
        assert!(Category::LongPolymer.matches("ab"));
        assert!(Category::Active.matches("ab*"));
        assert!(Category::ActiveMonomer.matches("a*"));
        assert!(Category::RightHanded.matches("ABa"));
        assert!(Category::LeftHanded.matches("abA"));
        assert!(Category::Exact("C".into()).matches("C"));
        assert_eq!(polymer_length("abc*"), 3);
        assert_eq!(polymer_length("a1"), 0);
    }

    #[test]
    fn product_builders() {
        assert_eq!(ProductBuilder::Join(String::new()).build(&["ab", "c"], None), vec!["abc"]);
        assert_eq!(ProductBuilder::Cut.build(&["abcd"], Some(1)), vec!["a", "bcd"]);
        assert_eq!(ProductBuilder::Split("-".into()).build(&["a-b"], None), vec!["a", "b"]);
        assert_eq!(ProductBuilder::Activate.build(&["ab"], None), vec!["ab*"]);
        assert_eq!(ProductBuilder::Deactivate.build(&["ab*"], None), vec!["ab"]);
        assert_eq!(ProductBuilder::ActivePolymerize.build(&["ab*", "C"], None), vec!["abC"]);
        assert_eq!(ProductBuilder::Epimerize.build(&["abc"], Some(1)), vec!["aBc"]);
    }

    #[test]
    fn variants_enumerate_cut_points() {
        assert_eq!(VariantPolicy::Interior.variants(&["abcd"]), vec![Some(1), Some(2), Some(3)]);
        assert_eq!(VariantPolicy::Positions.variants(&["ab"]), vec![Some(0), Some(1)]);
        assert_eq!(VariantPolicy::None.variants(&["ab"]), vec![None]);
        let range = VariantPolicy::Range {
            first_offset: 1,
            last_offset: 1,
            reactant: 0,
        };
        assert_eq!(range.variants(&["ab"]), vec![Some(1), Some(2)]);
    }

    #[test]
    fn alternate_kinetics_follow_the_cut_site() {
        let params = polymer_params();
        let kinetic = Kinetic::Alternate {
            condition: Condition::SameCaseAtCut,
            if_true: Box::new(Kinetic::Param("kh_same".into())),
            if_false: Box::new(Kinetic::Param("kh_diff".into())),
        };
        assert_eq!(kinetic.constant(&["abC"], Some(1), &params), 1.0);
        assert_eq!(kinetic.constant(&["abC"], Some(2), &params), 5.0);
    }

    #[test]
    fn worker_sweep_spreads_across_ranks() {
        let mut values = BTreeMap::new();
        values.insert("lo".to_string(), 1.0);
        values.insert("hi".to_string(), 3.0);
        let kinetic = Kinetic::WorkerSweep {
            start: "lo".into(),
            end: "hi".into(),
        };
        let last = Parameters::new(&values, WorkerContext { rank: 2, size: 3 });
        let alone = Parameters::new(&values, WorkerContext::single());
        assert_eq!(kinetic.constant(&[], None, &last), 3.0);
        assert_eq!(kinetic.constant(&[], None, &alone), 1.0);
    }

    #[test]
    fn mass_action_constant_accounts_for_repeats_and_volume() {
        let params = polymer_params();
        let mut ruleset = Ruleset::new();
        let spec = RuleSpec {
            reactants: vec![Category::Polymer, Category::Polymer],
            products: ProductBuilder::Join(String::new()),
            constant: Kinetic::Param("kp".into()),
            variants: VariantPolicy::None,
            rate: RateFunction::MassAction,
            robust: true,
            descr: String::new(),
        };
        let id = ruleset.add_rule("P", &spec, &params).unwrap();
        let rule = ruleset.rule(id);
        assert_eq!(stoichiometry(&["a", "a"]), vec![("a".to_string(), 2)]);
        assert_eq!(
            rule.build_products(&["a", "a"], None).unwrap(),
            vec![("aa".to_string(), 1)]
        );
        let constant = rule.constant_for(&["a", "a"], None, &params, 4.0);
        assert!((constant - 2.0 / 2.0 / 4.0).abs() < 1e-12);
        assert!(ruleset.add_rule("P", &spec, &params).is_err());
    }

    #[test]
    fn empty_products_are_rejected() {
        let params = polymer_params();
        let mut ruleset = Ruleset::new();
        let spec = RuleSpec {
            reactants: vec![Category::Polymer],
            products: ProductBuilder::Cut,
            constant: Kinetic::Value(1.0),
            variants: VariantPolicy::Positions,
            rate: RateFunction::MassAction,
            robust: true,
            descr: String::new(),
        };
        let id = ruleset.add_rule("H", &spec, &params).unwrap();
        let err = ruleset.rule(id).build_products(&["ab"], Some(0));
        assert!(matches!(err, Err(SimError::InvalidProduct { .. })));
    }

    #[test]
    fn unknown_parameters_and_bad_expressions_are_input_errors() {
        let params = polymer_params();
        let mut ruleset = Ruleset::new();
        let mut spec = RuleSpec {
            reactants: vec![Category::Polymer],
            products: ProductBuilder::Activate,
            constant: Kinetic::Param("missing".into()),
            variants: VariantPolicy::None,
            rate: RateFunction::MassAction,
            robust: true,
            descr: String::new(),
        };
        assert!(ruleset.add_rule("A", &spec, &params).unwrap_err().is_input_error());
        spec.constant = Kinetic::Value(1.0);
        spec.rate = RateFunction::Expression("k * x3".into());
        assert!(ruleset.add_rule("A", &spec, &params).is_err());
        spec.rate = RateFunction::Expression("k * x0 / v".into());
        assert!(ruleset.add_rule("A", &spec, &params).is_ok());
    }

    #[test]
    fn rate_kinds_compute_propensities() {
        assert_eq!(falling_factorial(5, 0), 1.0);
        assert_eq!(falling_factorial(5, 2), 20.0);
        assert_eq!(falling_factorial(3, 4), 0.0);
        let mass = RateKind::MassAction;
        assert_eq!(mass.propensity(1.0, 1.0, &[10, 10], &[(10, 1), (10, 1)]), 100.0);
        let hill = RateKind::compile(
            &RateFunction::Hill {
                reactant: 0,
                hill_n: 2.0,
                k_half: 3.0,
            },
            1,
        )
        .unwrap();
        assert!((hill.propensity(10.0, 1.0, &[4], &[(4, 1)]) - 6.4).abs() < 1e-12);
        let mm = RateKind::compile(&RateFunction::MichaelisMenten { reactant: 0, k_m: 4.0 }, 1)
            .unwrap();
        assert!((mm.propensity(8.0, 1.0, &[6], &[(6, 1)]) - 4.8).abs() < 1e-12);
        let expr = RateKind::compile(&RateFunction::Expression("2.0 * x0 + x1".into()), 2).unwrap();
        assert!((expr.propensity(1.0, 1.0, &[3, 5], &[(3, 1), (5, 1)]) - 11.0).abs() < 1e-12);
        let negative = RateKind::compile(&RateFunction::Expression("x0 - 10".into()), 1).unwrap();
        assert_eq!(negative.propensity(1.0, 1.0, &[3], &[(3, 1)]), 0.0);
    }

    #[test]
    fn infeasible_stoichiometry_has_no_propensity_under_any_rate_law() {
        // a dimerization with a single copy left
        let mm = RateKind::compile(&RateFunction::MichaelisMenten { reactant: 0, k_m: 1.0 }, 2)
            .unwrap();
        assert_eq!(mm.propensity(1.0, 1.0, &[1, 1], &[(1, 2)]), 0.0);
        assert!(mm.propensity(1.0, 1.0, &[2, 2], &[(2, 2)]) > 0.0);

        // E + S with the enzyme present but no substrate
        let hill = RateKind::compile(
            &RateFunction::Hill {
                reactant: 0,
                hill_n: 1.0,
                k_half: 1.0,
            },
            2,
        )
        .unwrap();
        assert_eq!(hill.propensity(1.0, 1.0, &[5, 0], &[(5, 1), (0, 1)]), 0.0);
        assert!(hill.propensity(1.0, 1.0, &[5, 1], &[(5, 1), (1, 1)]) > 0.0);

        let expr = RateKind::compile(&RateFunction::Expression("k * 3".into()), 1).unwrap();
        assert_eq!(expr.propensity(1.0, 1.0, &[0], &[(0, 1)]), 0.0);
        assert_eq!(expr.propensity(1.0, 1.0, &[1], &[(1, 1)]), 3.0);
    }
}
