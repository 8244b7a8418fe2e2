//! Per-step statistics over the compound or reaction collection.
//!
//! A statistic reduces one property of every object in the collection to a
//! single value; a map does the same within groups of objects sharing the
//! value of a `sort` property.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::network::ReactionNetwork;
use crate::rules::{asymmetry, polymer_length};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    #[default]
    Compounds,
    Reactions,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    /// 1 for every object.
    #[default]
    Count,
    /// Compound population.
    Pop,
    /// Reaction weight.
    Rate,
    /// `x ln x` of the population (compounds) or weight (reactions).
    Entropy,
    /// Polymer length of a compound.
    Length,
    /// Right-handed minus left-handed units of a compound.
    Asymmetry,
}

impl Property {
    fn applies_to(self, collection: Collection) -> bool {
        match self {
            Property::Count | Property::Entropy => true,
            Property::Rate => collection == Collection::Reactions,
            Property::Pop | Property::Length | Property::Asymmetry => {
                collection == Collection::Compounds
            }
        }
    }

    fn of_compound(self, name: &str, population: u64) -> f64 {
        match self {
            Property::Count => 1.0,
            Property::Pop => population as f64,
            Property::Entropy => entropy(population as f64),
            Property::Length => polymer_length(name) as f64,
            Property::Asymmetry => asymmetry(name) as f64,
            Property::Rate => 0.0,
        }
    }

    fn of_reaction(self, weight: f64) -> f64 {
        match self {
            Property::Count => 1.0,
            Property::Rate => weight,
            Property::Entropy => entropy(weight),
            Property::Pop | Property::Length | Property::Asymmetry => 0.0,
        }
    }
}

fn entropy(value: f64) -> f64 {
    if value == 0.0 { 0.0 } else { value * value.ln() }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatMethod {
    /// Weighted sum.
    #[serde(rename = "+")]
    Sum,
    /// Weighted mean.
    #[serde(rename = "m")]
    Mean,
    /// Largest value among the objects of non-zero weight.
    #[serde(rename = "max")]
    Max,
    /// Smallest value among the objects of non-zero weight.
    #[serde(rename = "min")]
    Min,
}

impl StatMethod {
    /// `None` when the method has nothing to reduce: no weight for a mean,
    /// no weighted object for an extremum.
    fn reduce(self, items: impl Iterator<Item = (f64, f64)>) -> Option<f64> {
        match self {
            StatMethod::Sum => Some(items.map(|(value, weight)| value * weight).sum()),
            StatMethod::Mean => {
                let (sum, weights) = items.fold((0.0, 0.0), |(sum, weights), (value, weight)| {
                    (sum + value * weight, weights + weight)
                });
                (weights > 0.0).then(|| sum / weights)
            }
            StatMethod::Max => items
                .filter(|&(_, weight)| weight > 0.0)
                .map(|(value, _)| value)
                .max_by(f64::total_cmp),
            StatMethod::Min => items
                .filter(|&(_, weight)| weight > 0.0)
                .map(|(value, _)| value)
                .min_by(f64::total_cmp),
        }
    }
}

fn default_stat_method() -> StatMethod {
    StatMethod::Mean
}

fn default_map_method() -> StatMethod {
    StatMethod::Sum
}

/// One scalar statistic, computed at every time step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatSpec {
    #[serde(default)]
    pub prop: Property,
    #[serde(default)]
    pub weight: Property,
    #[serde(default = "default_stat_method")]
    pub method: StatMethod,
    /// Also count absent compounds and zero-weight reactions.
    #[serde(default)]
    pub full: bool,
    #[serde(default)]
    pub collection: Collection,
}

impl Default for StatSpec {
    fn default() -> Self {
        Self {
            prop: Property::Count,
            weight: Property::Count,
            method: default_stat_method(),
            full: false,
            collection: Collection::Compounds,
        }
    }
}

/// A statistic broken down by the value of `sort`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapSpec {
    #[serde(default)]
    pub prop: Property,
    #[serde(default)]
    pub weight: Property,
    #[serde(default)]
    pub sort: Property,
    #[serde(default = "default_map_method")]
    pub method: StatMethod,
    #[serde(default)]
    pub full: bool,
    #[serde(default)]
    pub collection: Collection,
}

impl Default for MapSpec {
    fn default() -> Self {
        Self {
            prop: Property::Count,
            weight: Property::Count,
            sort: Property::Count,
            method: default_map_method(),
            full: false,
            collection: Collection::Compounds,
        }
    }
}

fn check(name: &str, collection: Collection, properties: &[Property]) -> Result<(), SimError> {
    match properties.iter().find(|prop| !prop.applies_to(collection)) {
        Some(prop) => Err(SimError::invalid(format!(
            "statistic '{name}': {prop:?} is not a property of {collection:?}"
        ))),
        None => Ok(()),
    }
}

/// `(prop, weight, sort)` for every object in scope.
fn values(
    network: &ReactionNetwork,
    collection: Collection,
    full: bool,
    [prop, weight, sort]: [Property; 3],
) -> Vec<(f64, f64, f64)> {
    match collection {
        Collection::Compounds => network
            .compounds()
            .filter(|compound| full || compound.population() > 0)
            .map(|compound| {
                let (name, pop) = (compound.name(), compound.population());
                (
                    prop.of_compound(name, pop),
                    weight.of_compound(name, pop),
                    sort.of_compound(name, pop),
                )
            })
            .collect(),
        Collection::Reactions => network
            .weights()
            .filter(|&(_, rate)| full || rate > 0.0)
            .map(|(_, rate)| {
                (
                    prop.of_reaction(rate),
                    weight.of_reaction(rate),
                    sort.of_reaction(rate),
                )
            })
            .collect(),
    }
}

impl StatSpec {
    pub fn validate(&self, name: &str) -> Result<(), SimError> {
        check(name, self.collection, &[self.prop, self.weight])
    }

    pub fn compute(&self, network: &ReactionNetwork) -> Option<f64> {
        let items = values(
            network,
            self.collection,
            self.full,
            [self.prop, self.weight, Property::Count],
        );
        self.method
            .reduce(items.into_iter().map(|(value, weight, _)| (value, weight)))
    }
}

impl MapSpec {
    pub fn validate(&self, name: &str) -> Result<(), SimError> {
        check(name, self.collection, &[self.prop, self.weight, self.sort])
    }

    /// `(sort value, statistic)` pairs in increasing sort order. Groups the
    /// method cannot reduce are left out.
    pub fn compute(&self, network: &ReactionNetwork) -> Vec<(f64, f64)> {
        let mut items = values(
            network,
            self.collection,
            self.full,
            [self.prop, self.weight, self.sort],
        );
        items.sort_by(|a, b| a.2.total_cmp(&b.2));
        let mut map = Vec::new();
        for group in items.chunk_by(|a, b| a.2.total_cmp(&b.2) == Ordering::Equal) {
            let reduced = self
                .method
                .reduce(group.iter().map(|&(value, weight, _)| (value, weight)));
            if let Some(value) = reduced {
                map.push((group[0].2, value));
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::CollectionPolicy;
    use crate::rules::{Parameters, RateFunction, Ruleset};

    fn polymers() -> ReactionNetwork {
        let mut network = ReactionNetwork::new(
            Ruleset::new(),
            Parameters::default(),
            1.0,
            CollectionPolicy::Keep,
        )
        .unwrap();
        network.add_compound("a", 6).unwrap();
        network.add_compound("ab", 2).unwrap();
        network.add_compound("abc", 1).unwrap();
        network.add_compound("Ab", 0).unwrap();
        network
            .add_reaction(&["a", "ab"], &["aab"], 1.0, RateFunction::MassAction)
            .unwrap();
        network
            .add_reaction(&["Ab"], &["A", "b"], 1.0, RateFunction::MassAction)
            .unwrap();
        network
    }

    #[test]
    fn scalar_statistics_reduce_the_active_collection() {
        let network = polymers();
        let count = StatSpec {
            method: StatMethod::Sum,
            ..StatSpec::default()
        };
        assert_eq!(count.compute(&network), Some(3.0));
        let all = StatSpec {
            full: true,
            ..count.clone()
        };
        assert_eq!(all.compute(&network), Some(4.0));

        // population-weighted mean length: (6 * 1 + 2 * 2 + 1 * 3) / 9
        let mean_length = StatSpec {
            prop: Property::Length,
            weight: Property::Pop,
            ..StatSpec::default()
        };
        let value = mean_length.compute(&network).unwrap();
        assert!((value - 13.0 / 9.0).abs() < 1e-12);

        let longest = StatSpec {
            prop: Property::Length,
            method: StatMethod::Max,
            ..StatSpec::default()
        };
        assert_eq!(longest.compute(&network), Some(3.0));
        let shortest = StatSpec {
            method: StatMethod::Min,
            ..longest
        };
        assert_eq!(shortest.compute(&network), Some(1.0));
    }

    #[test]
    fn reaction_statistics_read_the_weights() {
        let network = polymers();
        let total = StatSpec {
            prop: Property::Rate,
            method: StatMethod::Sum,
            collection: Collection::Reactions,
            ..StatSpec::default()
        };
        assert_eq!(total.compute(&network), Some(12.0));
        let firing = StatSpec {
            method: StatMethod::Sum,
            collection: Collection::Reactions,
            ..StatSpec::default()
        };
        assert_eq!(firing.compute(&network), Some(1.0));
        let idle = StatSpec {
            full: true,
            ..firing
        };
        assert_eq!(idle.compute(&network), Some(2.0));
    }

    #[test]
    fn empty_weights_give_no_value() {
        let network = polymers();
        let mean = StatSpec {
            prop: Property::Length,
            weight: Property::Pop,
            full: true,
            collection: Collection::Compounds,
            method: StatMethod::Mean,
        };
        assert!(mean.compute(&network).is_some());
        let nothing = StatSpec {
            method: StatMethod::Max,
            collection: Collection::Reactions,
            weight: Property::Rate,
            prop: Property::Rate,
            full: true,
        };
        assert_eq!(nothing.compute(&network), Some(12.0));
        let empty = ReactionNetwork::new(
            Ruleset::new(),
            Parameters::default(),
            1.0,
            CollectionPolicy::Keep,
        )
        .unwrap();
        assert_eq!(mean.compute(&empty), None);
        assert_eq!(nothing.compute(&empty), None);
        assert_eq!(StatSpec::default().compute(&empty), None);
    }

    #[test]
    fn maps_group_by_the_sort_property() {
        let network = polymers();
        let distribution = MapSpec {
            weight: Property::Pop,
            sort: Property::Length,
            ..MapSpec::default()
        };
        assert_eq!(
            distribution.compute(&network),
            vec![(1.0, 6.0), (2.0, 2.0), (3.0, 1.0)]
        );
        let with_absent = MapSpec {
            full: true,
            ..distribution
        };
        // "Ab" has length 2 but no population
        assert_eq!(
            with_absent.compute(&network),
            vec![(1.0, 6.0), (2.0, 2.0), (3.0, 1.0)]
        );
        let members = MapSpec {
            sort: Property::Length,
            full: true,
            ..MapSpec::default()
        };
        assert_eq!(
            members.compute(&network),
            vec![(1.0, 1.0), (2.0, 2.0), (3.0, 1.0)]
        );
    }

    #[test]
    fn properties_must_belong_to_the_collection() {
        let rate_of_compounds = StatSpec {
            prop: Property::Rate,
            ..StatSpec::default()
        };
        assert!(rate_of_compounds.validate("r").unwrap_err().is_input_error());
        let length_of_reactions = MapSpec {
            sort: Property::Length,
            collection: Collection::Reactions,
            ..MapSpec::default()
        };
        assert!(length_of_reactions.validate("l").is_err());
        assert!(StatSpec::default().validate("n").is_ok());
        assert!(MapSpec::default().validate("m").is_ok());
    }

    #[test]
    fn methods_parse_from_their_symbols() {
        let spec: StatSpec =
            serde_json::from_str(r#"{"prop": "length", "weight": "pop", "method": "+"}"#).unwrap();
        assert_eq!(spec.method, StatMethod::Sum);
        assert_eq!(spec.collection, Collection::Compounds);
        let map: MapSpec = serde_json::from_str(r#"{"sort": "length"}"#).unwrap();
        assert_eq!(map.method, StatMethod::Sum);
        let stat: StatSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(stat.method, StatMethod::Mean);
        assert!(serde_json::from_str::<StatSpec>(r#"{"method": "median"}"#).is_err());
    }
}
