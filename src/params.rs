//! JSON run description, validated into a [`Ruleset`] and engine settings
//! before any simulation state exists.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::WorkerContext;
use crate::engine::{EngineConfig, SimulationEngine};
use crate::ensemble::derive_seed;
use crate::error::SimError;
use crate::network::{CollectionPolicy, ReactionNetwork};
use crate::rules::{
    Category, Condition, Kinetic, Parameters, ProductBuilder, RateFunction, RuleSpec, Ruleset,
    VariantPolicy,
};
use crate::selector::DEFAULT_RECOMPUTE_PERIOD;
use crate::snapshot::Snapshot;
use crate::stats::{MapSpec, StatSpec};

/// Built-in rule sets, merged with the explicit `rules`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleModel {
    /// Polymerization `P` and hydrolysis `H` of plain polymers, with
    /// `kpol_mono`/`kpol_long` and `khyd_head`/`khyd_queue` constants.
    PolymMinimal,
}

impl RuleModel {
    pub fn rules(self) -> BTreeMap<String, RuleSpec> {
        match self {
            RuleModel::PolymMinimal => {
                let mut rules = BTreeMap::new();
                rules.insert(
                    "P".to_string(),
                    RuleSpec {
                        reactants: vec![Category::Polymer, Category::Polymer],
                        products: ProductBuilder::Join(String::new()),
                        constant: Kinetic::Alternate {
                            condition: Condition::FirstLength(1),
                            if_true: Box::new(Kinetic::Param("kpol_mono".into())),
                            if_false: Box::new(Kinetic::Param("kpol_long".into())),
                        },
                        variants: VariantPolicy::None,
                        rate: RateFunction::MassAction,
                        robust: true,
                        descr: "Polymerization".into(),
                    },
                );
                rules.insert(
                    "H".to_string(),
                    RuleSpec {
                        reactants: vec![Category::Polymer],
                        products: ProductBuilder::Cut,
                        constant: Kinetic::Alternate {
                            condition: Condition::VariantEquals(1),
                            if_true: Box::new(Kinetic::Param("khyd_head".into())),
                            if_false: Box::new(Kinetic::Param("khyd_queue".into())),
                        },
                        variants: VariantPolicy::Range {
                            first_offset: 1,
                            last_offset: 0,
                            reactant: 0,
                        },
                        rate: RateFunction::MassAction,
                        robust: true,
                        descr: "Hydrolysis".into(),
                    },
                );
                rules
            }
        }
    }
}

fn default_name() -> String {
    "run".to_string()
}

fn default_volume() -> f64 {
    1.0
}

fn default_tend() -> f64 {
    1.0
}

fn default_tstep() -> f64 {
    0.01
}

fn default_maxsteps() -> u64 {
    10_000
}

fn default_recompute() -> u64 {
    DEFAULT_RECOMPUTE_PERIOD
}

fn default_workers() -> usize {
    1
}

fn default_sync_every() -> u64 {
    1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Params {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub comment: String,
    /// Initial populations of the whole pool.
    #[serde(default)]
    pub init: BTreeMap<String, u64>,
    /// Total monomer concentration; when set, the volume is derived from it.
    #[serde(default)]
    pub conc: Option<f64>,
    #[serde(default = "default_volume")]
    pub volume: f64,
    #[serde(default)]
    pub model: Option<RuleModel>,
    /// Restricts the rules to these names when not empty.
    #[serde(default)]
    pub reactions: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    #[serde(default)]
    pub rules: BTreeMap<String, RuleSpec>,
    #[serde(default = "default_tend")]
    pub tend: f64,
    #[serde(default = "default_tstep")]
    pub tstep: f64,
    #[serde(default = "default_maxsteps")]
    pub maxsteps: u64,
    #[serde(default)]
    pub max_events: Option<u64>,
    /// Wall-clock limit, in seconds.
    #[serde(default)]
    pub rtlim: Option<f64>,
    #[serde(default)]
    pub collection: CollectionPolicy,
    #[serde(default = "default_recompute")]
    pub recompute_every: u64,
    #[serde(default)]
    pub rebuild_every: Option<u64>,
    #[serde(default)]
    pub snapshot_every: Option<f64>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_sync_every")]
    pub sync_every: u64,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Compounds whose concentrations are reported at every time step.
    #[serde(default)]
    pub save: Vec<String>,
    /// Named statistics reported at every time step.
    #[serde(default)]
    pub stat: BTreeMap<String, StatSpec>,
    /// Named statistic maps reported at every time step.
    #[serde(default)]
    pub maps: BTreeMap<String, MapSpec>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            name: default_name(),
            comment: String::new(),
            init: BTreeMap::new(),
            conc: None,
            volume: default_volume(),
            model: None,
            reactions: Vec::new(),
            parameters: BTreeMap::new(),
            rules: BTreeMap::new(),
            tend: default_tend(),
            tstep: default_tstep(),
            maxsteps: default_maxsteps(),
            max_events: None,
            rtlim: None,
            collection: CollectionPolicy::Keep,
            recompute_every: default_recompute(),
            rebuild_every: None,
            snapshot_every: None,
            workers: default_workers(),
            sync_every: default_sync_every(),
            seed: None,
            save: Vec::new(),
            stat: BTreeMap::new(),
            maps: BTreeMap::new(),
        }
    }
}

fn positive(name: &str, value: f64) -> Result<(), SimError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SimError::invalid(format!("{name} must be positive, got {value}")))
    }
}

/// `Σ population × name length`, the amount of monomer units.
pub fn ptot(populations: &BTreeMap<String, u64>) -> u64 {
    populations
        .iter()
        .map(|(name, pop)| pop * name.chars().count() as u64)
        .sum()
}

impl Params {
    pub fn from_json(text: &str) -> Result<Self, SimError> {
        let params: Params = serde_json::from_str(text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_file(path: &Path) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        positive("tend", self.tend)?;
        positive("tstep", self.tstep)?;
        positive("volume", self.volume)?;
        if let Some(conc) = self.conc {
            positive("conc", conc)?;
            if ptot(&self.init) == 0 {
                return Err(SimError::invalid("conc requires a non-empty initial population"));
            }
        }
        if let Some(rtlim) = self.rtlim {
            positive("rtlim", rtlim)?;
        }
        if let Some(every) = self.snapshot_every {
            positive("snapshot_every", every)?;
        }
        if self.maxsteps == 0 {
            return Err(SimError::invalid("maxsteps must be at least 1"));
        }
        if self.workers == 0 {
            return Err(SimError::invalid("workers must be at least 1"));
        }
        if self.init.keys().chain(self.save.iter()).any(String::is_empty) {
            return Err(SimError::invalid("compound names must not be empty"));
        }
        for (name, spec) in &self.stat {
            spec.validate(name)?;
        }
        for (name, spec) in &self.maps {
            spec.validate(name)?;
        }
        let specs = self.rule_specs()?;
        if specs.is_empty() {
            return Err(SimError::invalid("no rule defined"));
        }
        self.build_ruleset(&self.parameters(WorkerContext {
            rank: 0,
            size: self.workers,
        }))?;
        Ok(())
    }

    /// Preset and explicit rules, filtered by `reactions`.
    pub fn rule_specs(&self) -> Result<BTreeMap<String, RuleSpec>, SimError> {
        let mut specs = self.model.map(RuleModel::rules).unwrap_or_default();
        for (name, spec) in &self.rules {
            if specs.insert(name.clone(), spec.clone()).is_some() {
                return Err(SimError::invalid(format!(
                    "rule '{name}' is defined both by the model and explicitly"
                )));
            }
        }
        if !self.reactions.is_empty() {
            for name in &self.reactions {
                if !specs.contains_key(name) {
                    return Err(SimError::invalid(format!("unknown reaction '{name}'")));
                }
            }
            specs.retain(|name, _| self.reactions.contains(name));
        }
        Ok(specs)
    }

    pub fn parameters(&self, context: WorkerContext) -> Parameters {
        Parameters::new(&self.parameters, context)
    }

    pub fn build_ruleset(&self, params: &Parameters) -> Result<Ruleset, SimError> {
        let mut ruleset = Ruleset::new();
        for (name, spec) in self.rule_specs()? {
            ruleset.add_rule(&name, &spec, params)?;
        }
        Ok(ruleset)
    }

    /// Initial populations of one worker: every count split evenly, the
    /// remainder going to the lowest ranks.
    pub fn partition(&self, context: WorkerContext) -> BTreeMap<String, u64> {
        let size = context.size.max(1) as u64;
        let rank = context.rank as u64;
        self.init
            .iter()
            .map(|(name, &pop)| {
                let share = pop / size + u64::from(rank < pop % size);
                (name.clone(), share)
            })
            .filter(|(_, pop)| *pop > 0)
            .collect()
    }

    /// Volume of one worker, fixed by its initial partition.
    pub fn volume_for(&self, context: WorkerContext) -> Result<f64, SimError> {
        match self.conc {
            Some(conc) => {
                let units = ptot(&self.partition(context));
                if units == 0 {
                    return Err(SimError::invalid(format!(
                        "worker {} receives no initial population",
                        context.rank
                    )));
                }
                Ok(units as f64 / conc)
            }
            None => Ok(self.volume / context.size.max(1) as f64),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            tend: self.tend,
            max_events: self.max_events,
            wall_clock: self.rtlim.map(Duration::from_secs_f64),
            rebuild_every: self.rebuild_every,
            snapshot_every: self.snapshot_every,
        }
    }

    pub fn seed_for(&self, context: WorkerContext) -> u64 {
        derive_seed(self.seed, context.rank as u64)
    }

    pub fn build_network(
        &self,
        context: WorkerContext,
        populations: &BTreeMap<String, u64>,
    ) -> Result<ReactionNetwork, SimError> {
        let parameters = self.parameters(context);
        let ruleset = self.build_ruleset(&parameters)?;
        let mut network = ReactionNetwork::from_populations(
            ruleset,
            parameters,
            self.volume_for(context)?,
            self.collection,
            populations,
        )?;
        network.set_recompute_period(self.recompute_every);
        Ok(network)
    }

    pub fn build_engine(
        &self,
        context: WorkerContext,
        seed: u64,
    ) -> Result<SimulationEngine, SimError> {
        let network = self.build_network(context, &self.partition(context))?;
        Ok(SimulationEngine::new(network, self.engine_config(), context, seed))
    }

    pub fn resume_engine(
        &self,
        snapshot: &Snapshot,
        context: WorkerContext,
        rng: ChaCha8Rng,
    ) -> Result<SimulationEngine, SimError> {
        let parameters = self.parameters(context);
        let ruleset = self.build_ruleset(&parameters)?;
        let mut engine = SimulationEngine::from_snapshot(
            snapshot,
            ruleset,
            parameters,
            self.volume_for(context)?,
            self.collection,
            self.engine_config(),
            context,
            rng,
        )?;
        engine.network_mut().set_recompute_period(self.recompute_every);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Collection, Property, StatMethod};

    const POLYMER_RUN: &str = r#"{
        "name": "polym",
        "init": {"a": 50, "b": 50},
        "conc": 0.5,
        "model": "polym_minimal",
        "parameters": {
            "kpol_mono": 1.0,
            "kpol_long": 0.5,
            "khyd_head": 0.1,
            "khyd_queue": 0.2
        },
        "tend": 2.0,
        "tstep": 0.5,
        "seed": 4
    }"#;

    #[test]
    fn parses_and_derives_volume_from_concentration() {
        let params = Params::from_json(POLYMER_RUN).unwrap();
        assert_eq!(params.workers, 1);
        assert_eq!(params.maxsteps, 10_000);
        assert_eq!(params.volume_for(WorkerContext::single()).unwrap(), 200.0);
        let parameters = params.parameters(WorkerContext::single());
        let ruleset = params.build_ruleset(&parameters).unwrap();
        assert_eq!(ruleset.len(), 2);
        assert_eq!(ruleset.rule_id("P"), Some(1));
    }

    #[test]
    fn explicit_rules_deserialize_from_tagged_variants() {
        let text = r#"{
            "init": {"A": 10},
            "rules": {
                "decay": {
                    "reactants": [{"exact": "A"}],
                    "products": {"fixed": ["B"]},
                    "constant": {"value": 0.5},
                    "rate": {"michaelis_menten": {"reactant": 0, "k_m": 3.0}}
                }
            }
        }"#;
        let params = Params::from_json(text).unwrap();
        let spec = &params.rules["decay"];
        assert!(spec.robust);
        assert_eq!(spec.variants, VariantPolicy::None);
        assert_eq!(
            spec.rate,
            RateFunction::MichaelisMenten {
                reactant: 0,
                k_m: 3.0
            }
        );
    }

    #[test]
    fn invalid_inputs_are_rejected_before_any_state() {
        for text in [
            r#"{"init": {"a": 1}, "model": "polym_minimal", "bogus": 1}"#,
            r#"{"init": {"a": 1}, "model": "polym_minimal"}"#,
            r#"{"init": {"a": 1}}"#,
            r#"{"init": {"a": 1}, "model": "polym_minimal", "tend": -1.0,
                "parameters": {"kpol_mono": 1, "kpol_long": 1, "khyd_head": 1, "khyd_queue": 1}}"#,
            r#"{"init": {"a": 1}, "model": "polym_minimal", "reactions": ["X"],
                "parameters": {"kpol_mono": 1, "kpol_long": 1, "khyd_head": 1, "khyd_queue": 1}}"#,
            r#"{"init": {"a": 1}, "model": "polym_minimal", "stat": {"r": {"prop": "rate"}},
                "parameters": {"kpol_mono": 1, "kpol_long": 1, "khyd_head": 1, "khyd_queue": 1}}"#,
        ] {
            let err = Params::from_json(text).unwrap_err();
            assert!(err.is_input_error(), "{text}: {err}");
        }
    }

    #[test]
    fn partition_spreads_the_remainder_over_low_ranks() {
        let mut params = Params::default();
        params.init.insert("a".into(), 10);
        params.init.insert("b".into(), 2);
        let shares: Vec<BTreeMap<String, u64>> = (0..3)
            .map(|rank| params.partition(WorkerContext { rank, size: 3 }))
            .collect();
        assert_eq!(shares[0]["a"], 4);
        assert_eq!(shares[1]["a"], 3);
        assert_eq!(shares[2]["a"], 3);
        assert_eq!(shares[1]["b"], 1);
        assert!(!shares[2].contains_key("b"));
        assert_eq!(params.volume_for(WorkerContext { rank: 0, size: 2 }).unwrap(), 0.5);
    }

    #[test]
    fn reaction_filter_keeps_named_rules() {
        let mut params = Params::from_json(POLYMER_RUN).unwrap();
        params.reactions = vec!["H".into()];
        let specs = params.rule_specs().unwrap();
        assert_eq!(specs.keys().collect::<Vec<_>>(), vec!["H"]);
    }

    #[test]
    fn statistics_and_maps_are_read_by_name() {
        let text = r#"{
            "init": {"a": 4},
            "model": "polym_minimal",
            "parameters": {"kpol_mono": 1, "kpol_long": 1, "khyd_head": 1, "khyd_queue": 1},
            "stat": {
                "meanlen": {"prop": "length", "weight": "pop"},
                "nreac": {"method": "+", "collection": "reactions", "full": true}
            },
            "maps": {"lendist": {"weight": "pop", "sort": "length"}}
        }"#;
        let params = Params::from_json(text).unwrap();
        assert_eq!(params.stat.len(), 2);
        assert_eq!(params.stat["meanlen"].method, StatMethod::Mean);
        assert_eq!(params.stat["nreac"].collection, Collection::Reactions);
        assert!(params.stat["nreac"].full);
        assert_eq!(params.maps["lendist"].sort, Property::Length);
        assert_eq!(params.maps["lendist"].method, StatMethod::Sum);
    }
}
