//! Compounds, reactions and the dependency sets linking them.
//!
//! Reactions are discovered from the rule table the first time all their
//! reactants are present, and their weights live in a [`WeightedSelector`]
//! keyed by [`ReactionId`]. Firing a reaction refreshes exactly the reactions
//! consuming a compound whose population changed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::rules::{
    Category, CategoryId, Kinetic, Parameters, ProductBuilder, RateFunction, RuleId, RuleSpec,
    Ruleset, Variant,
};
use crate::selector::{DEFAULT_RECOMPUTE_PERIOD, SelectorError, WeightedSelector};

pub type CompoundId = usize;
pub type ReactionId = usize;

/// What happens to the reactions of a compound whose population drops to zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionPolicy {
    /// Reactions stay registered with a zero weight.
    #[default]
    Keep,
    /// Reactions are deleted and rediscovered if the compound comes back.
    Drop,
}

#[derive(Clone, Debug)]
pub struct Compound {
    name: Arc<str>,
    population: u64,
    categories: Vec<CategoryId>,
    consumed_by: BTreeSet<ReactionId>,
    produced_by: BTreeSet<ReactionId>,
}

impl Compound {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn population(&self) -> u64 {
        self.population
    }

    pub fn consumed_by(&self) -> &BTreeSet<ReactionId> {
        &self.consumed_by
    }

    pub fn produced_by(&self) -> &BTreeSet<ReactionId> {
        &self.produced_by
    }
}

/// Identity of a concrete reaction: rule, reactant names in slot order and
/// variant.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReactionKey {
    pub rule: RuleId,
    pub reactants: Vec<Arc<str>>,
    pub variant: Variant,
}

#[derive(Clone, Debug)]
struct Reaction {
    key: ReactionKey,
    slots: Vec<CompoundId>,
    stoich: Vec<(CompoundId, u32)>,
    products: Option<Vec<(CompoundId, u32)>>,
    constant: f64,
    weight: f64,
}

#[derive(Default, Clone, Debug)]
struct Scratch {
    slot_pops: Vec<u64>,
    stoich_pops: Vec<(u64, u32)>,
    dirty: Vec<ReactionId>,
    changes: Vec<(CompoundId, u64, u64)>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CompoundView {
    pub name: String,
    pub population: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReactionView {
    pub id: ReactionId,
    pub rule: String,
    pub reactants: Vec<(String, u32)>,
    /// `None` until the reaction has fired once.
    pub products: Option<Vec<(String, u32)>>,
    pub constant: f64,
    pub weight: f64,
}

/// Read-only picture of the network, enough to render a dependency graph.
#[derive(Clone, Debug, Serialize)]
pub struct GraphView {
    pub volume: f64,
    pub compounds: Vec<CompoundView>,
    pub reactions: Vec<ReactionView>,
}

#[derive(Clone, Debug)]
pub struct ReactionNetwork {
    ruleset: Ruleset,
    params: Parameters,
    volume: f64,
    policy: CollectionPolicy,
    compounds: Vec<Compound>,
    compound_index: HashMap<Arc<str>, CompoundId>,
    reactions: Vec<Option<Reaction>>,
    free: Vec<ReactionId>,
    reaction_index: HashMap<ReactionKey, ReactionId>,
    active_by_category: Vec<BTreeSet<CompoundId>>,
    selector: WeightedSelector<ReactionId>,
    visit_markers: Vec<u64>,
    stamp: u64,
    scratch: Scratch,
}

fn merge_counts(ids: impl IntoIterator<Item = CompoundId>) -> Vec<(CompoundId, u32)> {
    let mut merged: Vec<(CompoundId, u32)> = Vec::new();
    for id in ids {
        match merged.iter_mut().find(|(existing, _)| *existing == id) {
            Some((_, count)) => *count += 1,
            None => merged.push((id, 1)),
        }
    }
    merged
}

/// Calls `visit` for every tuple taking one element from each pool.
fn for_each_combination(pools: &[Vec<CompoundId>], mut visit: impl FnMut(&[CompoundId])) {
    if pools.iter().any(Vec::is_empty) {
        return;
    }
    let mut cursor = vec![0usize; pools.len()];
    let mut tuple: Vec<CompoundId> = pools.iter().map(|pool| pool[0]).collect();
    loop {
        visit(&tuple);
        let mut level = pools.len();
        loop {
            if level == 0 {
                return;
            }
            level -= 1;
            cursor[level] += 1;
            if cursor[level] < pools[level].len() {
                tuple[level] = pools[level][cursor[level]];
                break;
            }
            cursor[level] = 0;
            tuple[level] = pools[level][0];
        }
    }
}

impl ReactionNetwork {
    pub fn new(
        ruleset: Ruleset,
        params: Parameters,
        volume: f64,
        policy: CollectionPolicy,
    ) -> Result<Self, SimError> {
        if !(volume.is_finite() && volume > 0.0) {
            return Err(SimError::invalid(format!("volume must be positive, got {volume}")));
        }
        let categories = ruleset.categories().len();
        Ok(Self {
            ruleset,
            params,
            volume,
            policy,
            compounds: Vec::new(),
            compound_index: HashMap::new(),
            reactions: Vec::new(),
            free: Vec::new(),
            reaction_index: HashMap::new(),
            active_by_category: vec![BTreeSet::new(); categories],
            selector: WeightedSelector::with_recompute_period(DEFAULT_RECOMPUTE_PERIOD),
            visit_markers: Vec::new(),
            stamp: 0,
            scratch: Scratch::default(),
        })
    }

    /// Builds a network holding `populations`, activating compounds in name
    /// order. The result depends only on the arguments.
    pub fn from_populations(
        ruleset: Ruleset,
        params: Parameters,
        volume: f64,
        policy: CollectionPolicy,
        populations: &BTreeMap<String, u64>,
    ) -> Result<Self, SimError> {
        let mut network = Self::new(ruleset, params, volume, policy)?;
        for (name, &population) in populations {
            if population > 0 {
                network.add_compound(name, population)?;
            }
        }
        Ok(network)
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn policy(&self) -> CollectionPolicy {
        self.policy
    }

    pub fn set_recompute_period(&mut self, period: u64) {
        self.selector.set_recompute_period(period);
    }

    pub fn compound(&self, name: &str) -> Option<&Compound> {
        self.compound_index.get(name).map(|&id| &self.compounds[id])
    }

    pub fn population(&self, name: &str) -> u64 {
        self.compound(name).map_or(0, Compound::population)
    }

    /// Population table of every compound currently present.
    pub fn populations(&self) -> BTreeMap<String, u64> {
        self.compounds
            .iter()
            .filter(|compound| compound.population > 0)
            .map(|compound| (compound.name.to_string(), compound.population))
            .collect()
    }

    /// Every known compound, absent ones included, in discovery order.
    pub fn compounds(&self) -> impl Iterator<Item = &Compound> {
        self.compounds.iter()
    }

    /// Live reactions with their current weight.
    pub fn weights(&self) -> impl Iterator<Item = (ReactionId, f64)> + '_ {
        self.reactions
            .iter()
            .enumerate()
            .filter_map(|(id, reaction)| reaction.as_ref().map(|reaction| (id, reaction.weight)))
    }

    pub fn compound_count(&self) -> usize {
        self.compounds.len()
    }

    pub fn reaction_count(&self) -> usize {
        self.reaction_index.len()
    }

    pub fn reaction_id(&self, key: &ReactionKey) -> Option<ReactionId> {
        self.reaction_index.get(key).copied()
    }

    pub fn weight(&self, reaction: ReactionId) -> Option<f64> {
        self.reactions
            .get(reaction)
            .and_then(Option::as_ref)
            .map(|reaction| reaction.weight)
    }

    pub fn total_weight(&self) -> f64 {
        self.selector.total_weight()
    }

    /// Sum of every live weight, recomputed from scratch.
    pub fn exact_total(&self) -> f64 {
        self.selector.exact_total()
    }

    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ReactionId, SelectorError> {
        self.selector.draw(rng)
    }

    pub fn label(&self, reaction: ReactionId) -> String {
        match self.reactions.get(reaction).and_then(Option::as_ref) {
            Some(reaction) => self.key_label(&reaction.key),
            None => format!("#{reaction}"),
        }
    }

    fn key_label(&self, key: &ReactionKey) -> String {
        let names: Vec<&str> = key.reactants.iter().map(|name| name.as_ref()).collect();
        let rule = &self.ruleset.rule(key.rule).name;
        match key.variant {
            Some(variant) => format!("{rule}:{}@{variant}", names.join("+")),
            None => format!("{rule}:{}", names.join("+")),
        }
    }

    fn intern(&mut self, name: &str) -> Result<CompoundId, SimError> {
        if let Some(&id) = self.compound_index.get(name) {
            return Ok(id);
        }
        if name.is_empty() {
            return Err(SimError::invalid("compound name must not be empty"));
        }
        let name: Arc<str> = Arc::from(name);
        let id = self.compounds.len();
        self.compounds.push(Compound {
            name: Arc::clone(&name),
            population: 0,
            categories: self.ruleset.categories_of(&name),
            consumed_by: BTreeSet::new(),
            produced_by: BTreeSet::new(),
        });
        self.compound_index.insert(name, id);
        Ok(id)
    }

    /// Adds `population` units of `name`, creating the compound if needed.
    pub fn add_compound(&mut self, name: &str, population: u64) -> Result<CompoundId, SimError> {
        let id = self.intern(name)?;
        if population == 0 {
            return Ok(id);
        }
        let before = self.compounds[id].population;
        let after = before
            .checked_add(population)
            .ok_or_else(|| SimError::invalid(format!("population of '{name}' overflows")))?;
        self.compounds[id].population = after;
        self.scratch.changes.clear();
        self.scratch.changes.push((id, before, after));
        self.propagate()?;
        Ok(id)
    }

    /// Registers an explicit reaction as a rule of its own and instantiates it.
    pub fn add_reaction(
        &mut self,
        reactants: &[&str],
        products: &[&str],
        rate_constant: f64,
        rate_function: RateFunction,
    ) -> Result<ReactionId, SimError> {
        let spec = RuleSpec {
            reactants: reactants
                .iter()
                .map(|name| Category::Exact(name.to_string()))
                .collect(),
            products: ProductBuilder::Fixed(products.iter().map(|name| name.to_string()).collect()),
            constant: Kinetic::Value(rate_constant),
            variants: Default::default(),
            rate: rate_function,
            robust: true,
            descr: String::new(),
        };
        let name = format!("{}->{}", reactants.join("+"), products.join("+"));
        let known_categories = self.ruleset.categories().len();
        let rule = self.ruleset.add_rule(&name, &spec, &self.params)?;
        self.sync_categories(known_categories);
        let mut slots = Vec::with_capacity(reactants.len());
        for name in reactants {
            slots.push(self.intern(name)?);
        }
        let key = ReactionKey {
            rule,
            reactants: slots
                .iter()
                .map(|&id| Arc::clone(&self.compounds[id].name))
                .collect(),
            variant: None,
        };
        self.spawn_reaction(key, slots)
    }

    fn sync_categories(&mut self, known: usize) {
        let categories = self.ruleset.categories().to_vec();
        for (category_id, category) in categories.iter().enumerate().skip(known) {
            let mut active = BTreeSet::new();
            for (id, compound) in self.compounds.iter_mut().enumerate() {
                if category.matches(&compound.name) {
                    compound.categories.push(category_id);
                    if compound.population > 0 {
                        active.insert(id);
                    }
                }
            }
            self.active_by_category.push(active);
        }
    }

    /// Reconstructs the network from its own population table, dropping
    /// absent compounds and the reactions that went with them.
    pub fn rebuild(&mut self) -> Result<(), SimError> {
        let populations = self.populations();
        let before = (self.compounds.len(), self.reaction_index.len());
        let mut fresh = Self::from_populations(
            self.ruleset.clone(),
            self.params.clone(),
            self.volume,
            self.policy,
            &populations,
        )?;
        fresh.selector.set_recompute_period(self.selector.recompute_period());
        *self = fresh;
        debug!(
            "network rebuilt: {} -> {} compounds, {} -> {} reactions",
            before.0,
            self.compounds.len(),
            before.1,
            self.reaction_index.len()
        );
        Ok(())
    }

    /// Fires `reaction`: consumes its reactants, produces its products and
    /// refreshes every dependent weight. Nothing is mutated on error.
    pub fn apply(&mut self, reaction: ReactionId) -> Result<(), SimError> {
        let Some(fired) = self.reactions.get(reaction).and_then(Option::as_ref) else {
            return Err(SimError::invalid(format!("unknown reaction #{reaction}")));
        };
        for &(compound, count) in &fired.stoich {
            let population = self.compounds[compound].population;
            if population < count as u64 {
                let err = SimError::NegativePopulation {
                    reaction: self.key_label(&fired.key),
                    compound: self.compounds[compound].name.to_string(),
                    population,
                    delta: -(count as i64),
                };
                log::error!("{err}");
                return Err(err);
            }
        }
        let products = match &fired.products {
            Some(products) => products.clone(),
            None => self.resolve_products(reaction)?,
        };

        let Some(fired) = self.reactions[reaction].as_ref() else {
            return Err(SimError::invalid(format!("unknown reaction #{reaction}")));
        };
        let mut deltas: Vec<(CompoundId, i64)> = fired
            .stoich
            .iter()
            .map(|&(compound, count)| (compound, -(count as i64)))
            .collect();
        for (compound, count) in products {
            match deltas.iter_mut().find(|(existing, _)| *existing == compound) {
                Some((_, delta)) => *delta += count as i64,
                None => deltas.push((compound, count as i64)),
            }
        }

        self.scratch.changes.clear();
        for (compound, delta) in deltas {
            if delta == 0 {
                continue;
            }
            let before = self.compounds[compound].population;
            let after = before.saturating_add_signed(delta);
            self.compounds[compound].population = after;
            self.scratch.changes.push((compound, before, after));
        }
        self.propagate()
    }

    fn resolve_products(
        &mut self,
        reaction: ReactionId,
    ) -> Result<Vec<(CompoundId, u32)>, SimError> {
        let Some(fired) = self.reactions[reaction].as_ref() else {
            return Err(SimError::invalid(format!("unknown reaction #{reaction}")));
        };
        let rule = self.ruleset.rule(fired.key.rule);
        let robust = rule.robust;
        let names: Vec<&str> = fired.key.reactants.iter().map(|name| name.as_ref()).collect();
        let built = rule.build_products(&names, fired.key.variant)?;
        let mut products = Vec::with_capacity(built.len());
        for (name, count) in built {
            products.push((self.intern(&name)?, count));
        }
        if robust {
            for &(compound, _) in &products {
                self.compounds[compound].produced_by.insert(reaction);
            }
            if let Some(fired) = self.reactions[reaction].as_mut() {
                fired.products = Some(products.clone());
            }
        }
        Ok(products)
    }

    /// Handles activations and depletions recorded in `scratch.changes`, then
    /// refreshes every reaction consuming a changed compound.
    fn propagate(&mut self) -> Result<(), SimError> {
        let changes = std::mem::take(&mut self.scratch.changes);
        for &(compound, before, after) in &changes {
            if before == 0 && after > 0 {
                self.activate(compound)?;
            } else if before > 0 && after == 0 {
                self.deactivate(compound);
            }
        }

        if self.stamp == u64::MAX {
            self.visit_markers.fill(0);
            self.stamp = 0;
        }
        self.stamp += 1;
        let mark = self.stamp;
        let mut dirty = std::mem::take(&mut self.scratch.dirty);
        dirty.clear();
        for &(compound, _, _) in &changes {
            for &reaction in &self.compounds[compound].consumed_by {
                if self.visit_markers[reaction] != mark {
                    self.visit_markers[reaction] = mark;
                    dirty.push(reaction);
                }
            }
        }
        let mut result = Ok(());
        for &reaction in &dirty {
            if let Err(err) = self.refresh(reaction) {
                result = Err(err);
                break;
            }
        }
        self.scratch.dirty = dirty;
        self.scratch.changes = changes;
        result
    }

    fn activate(&mut self, compound: CompoundId) -> Result<(), SimError> {
        for &category in &self.compounds[compound].categories {
            self.active_by_category[category].insert(compound);
        }
        let mut discovered: Vec<(ReactionKey, Vec<CompoundId>)> = Vec::new();
        let mut seen: HashSet<ReactionKey> = HashSet::new();
        for (rule_id, rule) in self.ruleset.rules().iter().enumerate() {
            for (position, &slot_category) in rule.reactants.iter().enumerate() {
                if !self.compounds[compound].categories.contains(&slot_category) {
                    continue;
                }
                let pools: Vec<Vec<CompoundId>> = rule
                    .reactants
                    .iter()
                    .enumerate()
                    .map(|(idx, &category)| {
                        if idx == position {
                            vec![compound]
                        } else {
                            self.active_by_category[category].iter().copied().collect()
                        }
                    })
                    .collect();
                for_each_combination(&pools, |slots| {
                    let names: Vec<Arc<str>> = slots
                        .iter()
                        .map(|&id| Arc::clone(&self.compounds[id].name))
                        .collect();
                    let plain: Vec<&str> = names.iter().map(|name| name.as_ref()).collect();
                    for variant in rule.variants.variants(&plain) {
                        let key = ReactionKey {
                            rule: rule_id,
                            reactants: names.clone(),
                            variant,
                        };
                        if !self.reaction_index.contains_key(&key) && seen.insert(key.clone()) {
                            discovered.push((key, slots.to_vec()));
                        }
                    }
                });
            }
        }
        for (key, slots) in discovered {
            self.spawn_reaction(key, slots)?;
        }
        Ok(())
    }

    fn deactivate(&mut self, compound: CompoundId) {
        for &category in &self.compounds[compound].categories {
            self.active_by_category[category].remove(&compound);
        }
        if self.policy == CollectionPolicy::Drop {
            let doomed: Vec<ReactionId> =
                self.compounds[compound].consumed_by.iter().copied().collect();
            for reaction in doomed {
                self.delete_reaction(reaction);
            }
        }
    }

    fn spawn_reaction(
        &mut self,
        key: ReactionKey,
        slots: Vec<CompoundId>,
    ) -> Result<ReactionId, SimError> {
        if let Some(&existing) = self.reaction_index.get(&key) {
            return Ok(existing);
        }
        let names: Vec<&str> = key.reactants.iter().map(|name| name.as_ref()).collect();
        let constant = self
            .ruleset
            .rule(key.rule)
            .constant_for(&names, key.variant, &self.params, self.volume);
        let stoich = merge_counts(slots.iter().copied());
        let reaction = Reaction {
            key: key.clone(),
            slots,
            stoich,
            products: None,
            constant,
            weight: 0.0,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.reactions[id] = Some(reaction);
                id
            }
            None => {
                self.reactions.push(Some(reaction));
                self.visit_markers.push(0);
                self.reactions.len() - 1
            }
        };
        if let Some(reaction) = self.reactions[id].as_ref() {
            for &(compound, _) in &reaction.stoich {
                self.compounds[compound].consumed_by.insert(id);
            }
        }
        self.reaction_index.insert(key, id);
        self.refresh(id)?;
        Ok(id)
    }

    fn delete_reaction(&mut self, reaction: ReactionId) {
        let Some(removed) = self.reactions[reaction].take() else {
            return;
        };
        for &(compound, _) in &removed.stoich {
            self.compounds[compound].consumed_by.remove(&reaction);
        }
        for &(compound, _) in removed.products.iter().flatten() {
            self.compounds[compound].produced_by.remove(&reaction);
        }
        self.reaction_index.remove(&removed.key);
        self.selector.remove(&reaction);
        self.free.push(reaction);
    }

    fn refresh(&mut self, reaction: ReactionId) -> Result<(), SimError> {
        let Some(current) = self.reactions[reaction].as_ref() else {
            return Ok(());
        };
        let scratch = &mut self.scratch;
        scratch.slot_pops.clear();
        scratch
            .slot_pops
            .extend(current.slots.iter().map(|&id| self.compounds[id].population));
        scratch.stoich_pops.clear();
        scratch.stoich_pops.extend(
            current
                .stoich
                .iter()
                .map(|&(id, count)| (self.compounds[id].population, count)),
        );
        let weight = self.ruleset.rule(current.key.rule).rate().propensity(
            current.constant,
            self.volume,
            &scratch.slot_pops,
            &scratch.stoich_pops,
        );
        if let Some(current) = self.reactions[reaction].as_mut() {
            current.weight = weight;
        }
        self.selector.insert_or_update(reaction, weight)?;
        Ok(())
    }

    pub fn view(&self) -> GraphView {
        let resolve = |items: &[(CompoundId, u32)]| -> Vec<(String, u32)> {
            items
                .iter()
                .map(|&(id, count)| (self.compounds[id].name.to_string(), count))
                .collect()
        };
        GraphView {
            volume: self.volume,
            compounds: self
                .compounds
                .iter()
                .map(|compound| CompoundView {
                    name: compound.name.to_string(),
                    population: compound.population,
                })
                .collect(),
            reactions: self
                .reactions
                .iter()
                .enumerate()
                .filter_map(|(id, reaction)| reaction.as_ref().map(|reaction| (id, reaction)))
                .map(|(id, reaction)| ReactionView {
                    id,
                    rule: self.key_label(&reaction.key),
                    reactants: resolve(&reaction.stoich),
                    products: reaction.products.as_deref().map(resolve),
                    constant: reaction.constant,
                    weight: reaction.weight,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkerContext;
    use crate::rules::VariantPolicy;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn empty_network(policy: CollectionPolicy) -> ReactionNetwork {
        ReactionNetwork::new(Ruleset::new(), Parameters::default(), 1.0, policy).unwrap()
    }

    fn polymer_network(policy: CollectionPolicy) -> ReactionNetwork {
        let params = Parameters::new(&BTreeMap::new(), WorkerContext::single());
        let mut ruleset = Ruleset::new();
        ruleset
            .add_rule(
                "P",
                &RuleSpec {
                    reactants: vec![Category::Polymer, Category::Polymer],
                    products: ProductBuilder::Join(String::new()),
                    constant: Kinetic::Value(1.0),
                    variants: VariantPolicy::None,
                    rate: RateFunction::MassAction,
                    robust: true,
                    descr: String::new(),
                },
                &params,
            )
            .unwrap();
        ruleset
            .add_rule(
                "H",
                &RuleSpec {
                    reactants: vec![Category::LongPolymer],
                    products: ProductBuilder::Cut,
                    constant: Kinetic::Value(0.5),
                    variants: VariantPolicy::Interior,
                    rate: RateFunction::MassAction,
                    robust: true,
                    descr: String::new(),
                },
                &params,
            )
            .unwrap();
        ReactionNetwork::new(ruleset, params, 1.0, policy).unwrap()
    }

    #[test]
    fn mass_action_weight_follows_each_firing() {
        let mut network = empty_network(CollectionPolicy::Keep);
        network.add_compound("A", 10).unwrap();
        network.add_compound("B", 10).unwrap();
        let reaction = network
            .add_reaction(&["A", "B"], &["C"], 1.0, RateFunction::MassAction)
            .unwrap();
        assert_eq!(network.weight(reaction), Some(100.0));
        assert_eq!(network.total_weight(), 100.0);

        network.apply(reaction).unwrap();
        assert_eq!(network.population("A"), 9);
        assert_eq!(network.population("B"), 9);
        assert_eq!(network.population("C"), 1);
        assert_eq!(network.weight(reaction), Some(81.0));
        assert_eq!(network.total_weight(), 81.0);
    }

    #[test]
    fn infeasible_firing_is_rejected_without_mutation() {
        let mut network = empty_network(CollectionPolicy::Keep);
        network.add_compound("A", 1).unwrap();
        let reaction = network
            .add_reaction(&["A", "A"], &["D"], 1.0, RateFunction::MassAction)
            .unwrap();
        assert_eq!(network.weight(reaction), Some(0.0));
        let err = network.apply(reaction).unwrap_err();
        match err {
            SimError::NegativePopulation {
                compound,
                population,
                delta,
                ..
            } => {
                assert_eq!(compound, "A");
                assert_eq!(population, 1);
                assert_eq!(delta, -2);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(network.population("A"), 1);
        assert_eq!(network.population("D"), 0);
    }

    #[test]
    fn saturating_rates_stop_when_a_reactant_runs_out() {
        let mut network = empty_network(CollectionPolicy::Keep);
        network.add_compound("A", 3).unwrap();
        network.add_compound("E", 5).unwrap();
        network.add_compound("S", 2).unwrap();
        let dimer = network
            .add_reaction(
                &["A", "A"],
                &["D"],
                1.0,
                RateFunction::MichaelisMenten { reactant: 0, k_m: 1.0 },
            )
            .unwrap();
        let enzyme = network
            .add_reaction(
                &["E", "S"],
                &["E", "P"],
                1.0,
                RateFunction::Hill {
                    reactant: 0,
                    hill_n: 1.0,
                    k_half: 1.0,
                },
            )
            .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        while let Ok(reaction) = network.draw(&mut rng) {
            network.apply(reaction).unwrap();
        }
        assert_eq!(network.population("A"), 1);
        assert_eq!(network.population("D"), 1);
        assert_eq!(network.population("E"), 5);
        assert_eq!(network.population("S"), 0);
        assert_eq!(network.population("P"), 2);
        assert_eq!(network.weight(dimer), Some(0.0));
        assert_eq!(network.weight(enzyme), Some(0.0));
        assert_eq!(network.total_weight(), 0.0);
    }

    #[test]
    fn rules_discover_reactions_for_new_compounds() {
        let mut network = polymer_network(CollectionPolicy::Keep);
        network.add_compound("a", 5).unwrap();
        network.add_compound("b", 5).unwrap();
        // a+a, a+b, b+a, b+b
        assert_eq!(network.reaction_count(), 4);
        let key = ReactionKey {
            rule: 0,
            reactants: vec![Arc::from("a"), Arc::from("b")],
            variant: None,
        };
        let join = network.reaction_id(&key).unwrap();
        network.apply(join).unwrap();
        assert_eq!(network.population("ab"), 1);
        // ab joins with a, b and itself, and can be cut once
        assert_eq!(network.reaction_count(), 4 + 5 + 1);
        let cut = network
            .reaction_id(&ReactionKey {
                rule: 1,
                reactants: vec![Arc::from("ab")],
                variant: Some(1),
            })
            .unwrap();
        assert_eq!(network.weight(cut), Some(0.5));
        let view = network.view();
        assert!(view.reactions.iter().any(|reaction| reaction.products.is_some()));
    }

    #[test]
    fn drop_policy_forgets_and_rediscovers() {
        let mut network = polymer_network(CollectionPolicy::Drop);
        network.add_compound("ab", 1).unwrap();
        let cut = network
            .reaction_id(&ReactionKey {
                rule: 1,
                reactants: vec![Arc::from("ab")],
                variant: Some(1),
            })
            .unwrap();
        network.apply(cut).unwrap();
        assert_eq!(network.population("ab"), 0);
        assert!(network.compound("ab").unwrap().consumed_by().is_empty());
        network.add_compound("ab", 1).unwrap();
        assert!(!network.compound("ab").unwrap().consumed_by().is_empty());
    }

    #[test]
    fn keep_policy_leaves_zero_weights() {
        let mut network = polymer_network(CollectionPolicy::Keep);
        network.add_compound("ab", 1).unwrap();
        let before = network.reaction_count();
        let cut = network.reaction_id(&ReactionKey {
            rule: 1,
            reactants: vec![Arc::from("ab")],
            variant: Some(1),
        });
        network.apply(cut.unwrap()).unwrap();
        assert!(network.reaction_count() >= before);
        assert_eq!(network.weight(cut.unwrap()), Some(0.0));
    }

    #[test]
    fn rebuild_collects_absent_compounds() {
        let mut network = polymer_network(CollectionPolicy::Keep);
        network.add_compound("ab", 1).unwrap();
        let cut = network
            .reaction_id(&ReactionKey {
                rule: 1,
                reactants: vec![Arc::from("ab")],
                variant: Some(1),
            })
            .unwrap();
        network.apply(cut).unwrap();
        let populations = network.populations();
        network.rebuild().unwrap();
        assert_eq!(network.populations(), populations);
        assert!(network.compound("ab").is_none());
        assert!((network.total_weight() - network.exact_total()).abs() < 1e-9);
    }

    #[test]
    fn invalid_volume_is_an_input_error() {
        let err = ReactionNetwork::new(
            Ruleset::new(),
            Parameters::default(),
            0.0,
            CollectionPolicy::Keep,
        )
        .unwrap_err();
        assert!(err.is_input_error());
    }

    proptest! {
        #[test]
        fn drawn_firings_never_go_negative(
            a in 0u64..20,
            b in 0u64..20,
            c in 0u64..20,
            seed in any::<u64>(),
        ) {
            let mut network = empty_network(CollectionPolicy::Keep);
            network.add_compound("A", a).unwrap();
            network.add_compound("B", b).unwrap();
            network.add_compound("C", c).unwrap();
            network.add_reaction(&["A", "B"], &["C"], 1.0, RateFunction::MassAction).unwrap();
            network.add_reaction(&["C"], &["A", "B"], 0.7, RateFunction::MassAction).unwrap();
            network.add_reaction(&["A", "A"], &["B"], 0.2, RateFunction::MassAction).unwrap();
            let mass = |network: &ReactionNetwork| {
                network.population("A") + 2 * network.population("B") + 3 * network.population("C")
            };
            let initial = mass(&network);
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            for _ in 0..200 {
                let Ok(reaction) = network.draw(&mut rng) else {
                    break;
                };
                prop_assert!(network.apply(reaction).is_ok());
                prop_assert_eq!(mass(&network), initial);
                let drift = (network.total_weight() - network.exact_total()).abs();
                prop_assert!(drift < 1e-6);
            }
        }
    }
}
