//! Synthetic factory telemetry
//!
//! A [`SnapshotSource`] that fabricates factory snapshots in the shape the
//! game-side collector emits (camelCase JSON keyed by planet id). Used by the
//! `serve` command so the stream can be exercised without a game attached.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::producer::{SnapshotSource, SourceError};

/// Game ticks per second
const TICKS_PER_SECOND: u64 = 60;

/// One factory-wide snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorySnapshot {
    pub game_tick: u64,
    /// Planets keyed by their id as a string
    pub planets: BTreeMap<String, PlanetSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanetSnapshot {
    pub planet_id: u32,
    pub planet_name: String,
    pub power: PowerSnapshot,
    pub production: Vec<ProductionSnapshot>,
    pub belts: Vec<BeltSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSnapshot {
    #[serde(rename = "generationMW")]
    pub generation_mw: f64,
    #[serde(rename = "consumptionMW")]
    pub consumption_mw: f64,
    #[serde(rename = "accumulatorPercent")]
    pub accumulator_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionSnapshot {
    pub assembler_id: u32,
    pub recipe_id: u32,
    pub proto_id: u32,
    pub production_rate: f64,
    pub items_produced: u64,
    pub input_starved: bool,
    pub output_blocked: bool,
    pub power_level: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeltSnapshot {
    pub belt_id: u32,
    pub item_type: u32,
    pub throughput: f64,
    pub max_throughput: f64,
}

struct PlanetTemplate {
    id: u32,
    name: &'static str,
    base_generation_mw: f64,
    base_consumption_mw: f64,
    recipes: &'static [(u32, u32, f64)],
}

const PLANETS: &[PlanetTemplate] = &[
    PlanetTemplate {
        id: 1,
        name: "Aurora Prime",
        base_generation_mw: 120.0,
        base_consumption_mw: 95.0,
        // (recipe id, product proto id, items per minute)
        recipes: &[(1, 1101, 60.0), (2, 1104, 30.0), (5, 1301, 45.0)],
    },
    PlanetTemplate {
        id: 2,
        name: "Cinder",
        base_generation_mw: 80.0,
        base_consumption_mw: 88.0,
        recipes: &[(17, 1203, 20.0), (18, 1204, 12.0)],
    },
];

/// Deterministic generator of plausible factory snapshots
pub struct FactorySimulator {
    game_tick: u64,
    ticks_per_snapshot: u64,
    /// Snapshots reported unavailable before the first real one
    warmup: u32,
    collected: u64,
}

impl FactorySimulator {
    /// `cadence_hz` is the rate the simulator will be polled at
    pub fn new(cadence_hz: f64) -> Self {
        let ticks = (TICKS_PER_SECOND as f64 / cadence_hz.max(1.0)).round() as u64;
        Self {
            game_tick: 0,
            ticks_per_snapshot: ticks.max(1),
            warmup: 0,
            collected: 0,
        }
    }

    /// Report the first `snapshots` collections as unavailable, like a game still loading
    pub fn with_warmup(mut self, snapshots: u32) -> Self {
        self.warmup = snapshots;
        self
    }

    fn planet(&self, template: &PlanetTemplate) -> PlanetSnapshot {
        let seconds = self.game_tick as f64 / TICKS_PER_SECOND as f64;
        let phase = template.id as f64;
        let wave = (seconds / 30.0 + phase).sin();

        let generation = template.base_generation_mw * (1.0 + 0.05 * wave);
        let consumption = template.base_consumption_mw * (1.0 + 0.1 * (seconds / 12.0 + phase).cos());
        let accumulator = (50.0 + 50.0 * wave).clamp(0.0, 100.0);
        let power_level = (generation / consumption).min(1.0);

        let production = template
            .recipes
            .iter()
            .enumerate()
            .map(|(i, &(recipe_id, proto_id, per_minute))| {
                let input_starved = (self.game_tick / 600 + i as u64) % 7 == 0;
                let rate = if input_starved { 0.0 } else { per_minute * power_level };
                ProductionSnapshot {
                    assembler_id: template.id * 1000 + i as u32 + 1,
                    recipe_id,
                    proto_id,
                    production_rate: rate,
                    items_produced: (per_minute * seconds / 60.0) as u64,
                    input_starved,
                    output_blocked: false,
                    power_level,
                }
            })
            .collect();

        let belts = template
            .recipes
            .iter()
            .enumerate()
            .map(|(i, &(_, proto_id, per_minute))| BeltSnapshot {
                belt_id: template.id * 100 + i as u32 + 1,
                item_type: proto_id,
                throughput: (per_minute / 60.0 * power_level * 10.0).min(30.0),
                max_throughput: 30.0,
            })
            .collect();

        PlanetSnapshot {
            planet_id: template.id,
            planet_name: template.name.to_string(),
            power: PowerSnapshot {
                generation_mw: generation,
                consumption_mw: consumption,
                accumulator_percent: accumulator,
            },
            production,
            belts,
        }
    }

    fn snapshot(&self) -> FactorySnapshot {
        FactorySnapshot {
            game_tick: self.game_tick,
            planets: PLANETS
                .iter()
                .map(|template| (template.id.to_string(), self.planet(template)))
                .collect(),
        }
    }
}

#[async_trait]
impl SnapshotSource for FactorySimulator {
    type Snapshot = FactorySnapshot;

    fn name(&self) -> &str {
        "factory-simulator"
    }

    async fn collect(&mut self) -> Result<FactorySnapshot, SourceError> {
        self.collected += 1;
        if self.collected <= self.warmup as u64 {
            return Err(SourceError::Unavailable("factory not loaded".to_string()));
        }

        self.game_tick += self.ticks_per_snapshot;
        Ok(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ticks_advance_with_cadence() {
        let mut sim = FactorySimulator::new(10.0);
        let first = sim.collect().await.unwrap();
        let second = sim.collect().await.unwrap();
        assert_eq!(first.game_tick, 6);
        assert_eq!(second.game_tick, 12);
    }

    #[tokio::test]
    async fn test_warmup_reports_unavailable() {
        let mut sim = FactorySimulator::new(1.0).with_warmup(2);
        assert!(matches!(sim.collect().await, Err(SourceError::Unavailable(_))));
        assert!(matches!(sim.collect().await, Err(SourceError::Unavailable(_))));

        let snapshot = sim.collect().await.unwrap();
        assert_eq!(snapshot.game_tick, 60);
    }

    #[tokio::test]
    async fn test_snapshot_wire_shape() {
        let mut sim = FactorySimulator::new(60.0);
        let snapshot = sim.collect().await.unwrap();
        let value = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(value["gameTick"], 1);
        let planet = &value["planets"]["1"];
        assert_eq!(planet["planetId"], 1);
        assert_eq!(planet["planetName"], "Aurora Prime");
        assert!(planet["power"]["generationMW"].as_f64().unwrap() > 0.0);
        assert!(planet["power"]["accumulatorPercent"].as_f64().is_some());
        assert_eq!(planet["production"][0]["recipeId"], 1);
        assert_eq!(planet["belts"][0]["maxThroughput"], 30.0);
    }

    #[tokio::test]
    async fn test_values_stay_in_range() {
        let mut sim = FactorySimulator::new(1.0);
        for _ in 0..200 {
            let snapshot = sim.collect().await.unwrap();
            for planet in snapshot.planets.values() {
                let percent = planet.power.accumulator_percent;
                assert!((0.0..=100.0).contains(&percent));
                for belt in &planet.belts {
                    assert!(belt.throughput <= belt.max_throughput);
                }
            }
        }
    }
}
