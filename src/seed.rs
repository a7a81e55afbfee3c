use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::db::{DriverError, EngineSession, Value};
use crate::error::HarnessError;
use crate::model::Model;

pub const DEFAULT_RNG_SEED: u64 = 20_250_701;

const STYLES: &[&str] = &[
    "Rock", "Pop", "Electro", "Jazz", "Métal", "Classique", "Hip-Hop", "Reggae",
];
const ROLES: &[&str] = &["Bar", "Accueil", "Sécurité", "Technique", "Catering", "VIP"];
const PARTNER_TYPES: &[&str] = &["Média", "Financier", "Boisson", "Matériel"];
const POSTES: &[&str] = &["Manager", "Membre équipe", "Stagiaire", "Superviseur"];
const ZONES: &[&str] = &["Nord", "Sud", "Est", "Ouest"];
const CAPACITIES: &[i64] = &[1000, 5000, 10000, 25000, 50000];
const DURATIONS_MIN: &[u64] = &[45, 60, 90, 120];
const AMOUNTS: &[i64] = &[500, 1000, 5000, 10000];

const COUNTRIES: &[&str] = &[
    "France", "Belgique", "Suisse", "Canada", "Allemagne", "Espagne", "Italie", "Japon",
    "Brésil", "Sénégal", "Royaume-Uni", "États-Unis",
];
const ADJECTIVES: &[&str] = &[
    "Electric", "Silent", "Golden", "Broken", "Wild", "Velvet", "Neon", "Lunar", "Iron",
    "Crimson", "Hollow", "Savage",
];
const NOUNS: &[&str] = &[
    "Wolves", "Echoes", "Machines", "Tides", "Pilots", "Ghosts", "Rivers", "Satellites",
    "Foxes", "Mirrors", "Drums", "Kings",
];
const SCENE_WORDS: &[&str] = &[
    "Horizon", "Forêt", "Lagune", "Colline", "Arène", "Verger", "Phare", "Prairie",
];
const LAST_NAMES: &[&str] = &[
    "Martin", "Bernard", "Dubois", "Thomas", "Robert", "Richard", "Petit", "Durand", "Leroy",
    "Moreau", "Simon", "Laurent", "Lefebvre", "Michel", "Garcia", "David",
];
const FIRST_NAMES: &[&str] = &[
    "Camille", "Lucas", "Léa", "Hugo", "Chloé", "Louis", "Manon", "Jules", "Inès", "Gabriel",
    "Sarah", "Arthur", "Emma", "Nathan", "Zoé", "Paul",
];
const COMPANY_PREFIXES: &[&str] = &[
    "Groupe", "Studio", "Maison", "Atelier", "Société", "Agence", "Brasserie", "Radio",
];
const COMPANY_NAMES: &[&str] = &[
    "Lumière", "Azur", "Boréal", "Cobalt", "Delta", "Éclat", "Fauve", "Garance", "Hélios",
    "Iris",
];

/// Table sizes and RNG seed for one fixture set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedPlan {
    pub groupes: usize,
    pub scenes: usize,
    pub benevoles: usize,
    pub partenaires: usize,
    pub concerts: usize,
    pub affectations: usize,
    pub sponsorings: usize,
    pub rng_seed: u64,
}

impl Default for SeedPlan {
    fn default() -> Self {
        Self {
            groupes: 500,
            scenes: 50,
            benevoles: 2000,
            partenaires: 100,
            concerts: 5000,
            affectations: 15000,
            sponsorings: 1000,
            rng_seed: DEFAULT_RNG_SEED,
        }
    }
}

impl SeedPlan {
    /// Every table scaled by `factor`, at least one row each.
    pub fn scaled(factor: f64) -> Self {
        let base = Self::default();
        let scale = |n: usize| ((n as f64 * factor).round() as usize).max(1);
        Self {
            groupes: scale(base.groupes),
            scenes: scale(base.scenes),
            benevoles: scale(base.benevoles),
            partenaires: scale(base.partenaires),
            concerts: scale(base.concerts),
            affectations: scale(base.affectations),
            sponsorings: scale(base.sponsorings),
            rng_seed: base.rng_seed,
        }
    }

    pub fn with_seed(mut self, rng_seed: u64) -> Self {
        self.rng_seed = rng_seed;
        self
    }
}

/// Rows for one table, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRows {
    pub table: &'static str,
    pub columns: &'static [&'static str],
    pub rows: Vec<Vec<Value>>,
}

/// A complete fixture set, tables in parent-before-child order.
#[derive(Debug, Clone, PartialEq)]
pub struct Fixtures {
    pub tables: Vec<TableRows>,
}

/// Rows per table after a seeding pass, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowCounts(pub Vec<(&'static str, u64)>);

impl RowCounts {
    pub fn get(&self, table: &str) -> Option<u64> {
        self.0.iter().find(|(t, _)| *t == table).map(|(_, n)| *n)
    }

    pub fn total(&self) -> u64 {
        self.0.iter().map(|(_, n)| n).sum()
    }
}

fn pick<T: Copy + Default>(rng: &mut ChaCha8Rng, items: &[T]) -> T {
    items.choose(rng).copied().unwrap_or_default()
}

/// `count` distinct (left, right) id pairs, ids starting at 1. Capped at the
/// number of distinct pairs.
fn unique_pairs(rng: &mut ChaCha8Rng, left: usize, right: usize, count: usize) -> Vec<(i64, i64)> {
    let capacity = left.saturating_mul(right);
    let count = count.min(capacity);
    if count == 0 {
        return Vec::new();
    }

    // Dense request: rejection sampling would stall, take a shuffled prefix.
    if count.saturating_mul(2) > capacity {
        let mut all: Vec<(i64, i64)> = (1..=left as i64)
            .flat_map(|l| (1..=right as i64).map(move |r| (l, r)))
            .collect();
        all.shuffle(rng);
        all.truncate(count);
        return all;
    }

    let mut seen = HashSet::with_capacity(count);
    let mut pairs = Vec::with_capacity(count);
    while pairs.len() < count {
        let pair = (
            rng.gen_range(1..=left as i64),
            rng.gen_range(1..=right as i64),
        );
        if seen.insert(pair) {
            pairs.push(pair);
        }
    }
    pairs
}

impl Fixtures {
    pub fn generate(plan: &SeedPlan) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(plan.rng_seed);

        let groupes = (1..=plan.groupes as i64)
            .map(|id| {
                let name = format!(
                    "{} {} {}",
                    pick(&mut rng, ADJECTIVES),
                    pick(&mut rng, NOUNS),
                    id
                );
                vec![
                    Value::Int(id),
                    Value::Text(name),
                    Value::Text(pick(&mut rng, STYLES).to_string()),
                    Value::Text(pick(&mut rng, COUNTRIES).to_string()),
                    Value::Int(rng.gen_range(1..=10)),
                ]
            })
            .collect();

        let scenes = (1..=plan.scenes as i64)
            .map(|id| {
                vec![
                    Value::Int(id),
                    Value::Text(format!("Scène {} {}", pick(&mut rng, SCENE_WORDS), id)),
                    Value::Text(format!("Zone {}", pick(&mut rng, ZONES))),
                    Value::Int(pick(&mut rng, CAPACITIES)),
                ]
            })
            .collect();

        let benevoles = (1..=plan.benevoles as i64)
            .map(|id| {
                let nom = pick(&mut rng, LAST_NAMES);
                let prenom = pick(&mut rng, FIRST_NAMES);
                let phone = format!(
                    "06 {:02} {:02} {:02} {:02}",
                    rng.gen_range(0..100),
                    rng.gen_range(0..100),
                    rng.gen_range(0..100),
                    rng.gen_range(0..100)
                );
                let email = format!("benevole{}@festival.example", id);
                vec![
                    Value::Int(id),
                    Value::Text(nom.to_string()),
                    Value::Text(prenom.to_string()),
                    Value::Text(phone),
                    Value::Text(email),
                    Value::Text(pick(&mut rng, POSTES).to_string()),
                ]
            })
            .collect();

        let partenaires = (1..=plan.partenaires as i64)
            .map(|id| {
                let name = format!(
                    "{} {} {}",
                    pick(&mut rng, COMPANY_PREFIXES),
                    pick(&mut rng, COMPANY_NAMES),
                    id
                );
                vec![
                    Value::Int(id),
                    Value::Text(name),
                    Value::Text(pick(&mut rng, PARTNER_TYPES).to_string()),
                ]
            })
            .collect();

        // Concerts fall between 2025-07-01 and 2025-07-05.
        let festival_start = NaiveDate::from_ymd_opt(2025, 7, 1)
            .unwrap_or_default()
            .and_time(NaiveTime::MIN);
        let concerts = (1..=plan.concerts as i64)
            .map(|id| {
                let offset = rng.gen_range(0..4 * 86_400);
                let start: NaiveDateTime = festival_start + TimeDelta::seconds(offset);
                let minutes = pick(&mut rng, DURATIONS_MIN);
                vec![
                    Value::Int(id),
                    Value::Date(start.date()),
                    Value::Timestamp(start),
                    Value::Interval(Duration::from_secs(minutes * 60)),
                    Value::Int(rng.gen_range(1..=plan.scenes.max(1) as i64)),
                    Value::Int(rng.gen_range(1..=plan.groupes.max(1) as i64)),
                ]
            })
            .collect();

        let affectations = unique_pairs(&mut rng, plan.benevoles, plan.concerts, plan.affectations)
            .into_iter()
            .map(|(benevole, concert)| {
                vec![
                    Value::Int(benevole),
                    Value::Int(concert),
                    Value::Text(pick(&mut rng, ROLES).to_string()),
                ]
            })
            .collect();

        let sponsorings = unique_pairs(&mut rng, plan.partenaires, plan.concerts, plan.sponsorings)
            .into_iter()
            .map(|(partenaire, concert)| {
                vec![
                    Value::Int(partenaire),
                    Value::Int(concert),
                    Value::Decimal(Decimal::new(pick(&mut rng, AMOUNTS) * 100, 2)),
                ]
            })
            .collect();

        Fixtures {
            tables: vec![
                TableRows {
                    table: "groupe",
                    columns: &["id_groupe", "nom_groupe", "style", "pays_origine", "nb_membres"],
                    rows: groupes,
                },
                TableRows {
                    table: "scene",
                    columns: &["id_scene", "nom_scene", "emplacement", "capacite"],
                    rows: scenes,
                },
                TableRows {
                    table: "benevole",
                    columns: &["id_benevole", "nom", "prenom", "telephone", "email", "poste"],
                    rows: benevoles,
                },
                TableRows {
                    table: "partenaire",
                    columns: &["id_partenaire", "nom_partenaire", "type_partenaire"],
                    rows: partenaires,
                },
                TableRows {
                    table: "concert",
                    columns: &[
                        "id_concert",
                        "date_concert",
                        "heure_debut",
                        "duree",
                        "id_scene",
                        "id_groupe",
                    ],
                    rows: concerts,
                },
                TableRows {
                    table: "affectation",
                    columns: &["id_benevole", "id_concert", "role"],
                    rows: affectations,
                },
                TableRows {
                    table: "sponsoring",
                    columns: &["id_partenaire", "id_concert", "montant"],
                    rows: sponsorings,
                },
            ],
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableRows> {
        self.tables.iter().find(|t| t.table == name)
    }
}

/// Clear every harness table and insert `fixtures`, in one transaction.
///
/// Re-runnable: the previous contents are deleted first, dependents before
/// parents. Any failure rolls the transaction back.
pub async fn seed(
    session: &mut dyn EngineSession,
    model: &Model,
    fixtures: &Fixtures,
) -> Result<RowCounts, HarnessError> {
    let engine = session.kind();
    let dialect = session.dialect();
    let order = model.creation_order().map_err(HarnessError::Model)?;
    let started = Instant::now();

    session.begin().await.map_err(|source| HarnessError::Seed {
        engine,
        table: "(transaction)".to_string(),
        source,
    })?;

    let mut current: &str = "";
    let result = async {
        for entity in order.iter().rev() {
            current = entity.name;
            session.execute(&dialect.delete_all(entity.name)).await?;
        }

        let mut counts = Vec::with_capacity(fixtures.tables.len());
        for table in &fixtures.tables {
            current = table.table;
            for chunk in table.rows.chunks(dialect.insert_chunk_size().max(1)) {
                session
                    .execute(&dialect.insert_rows(table.table, table.columns, chunk))
                    .await?;
            }
            tracing::debug!(engine = %engine, table = table.table, rows = table.rows.len(), "inserted");
            counts.push((table.table, table.rows.len() as u64));
        }

        current = "(commit)";
        session.commit().await?;
        Ok::<_, DriverError>(RowCounts(counts))
    }
    .await;

    let counts = match result {
        Ok(counts) => counts,
        Err(source) => {
            if let Err(e) = session.rollback().await {
                tracing::warn!(engine = %engine, error = %e, "rollback after failed seed failed");
            }
            return Err(HarnessError::Seed {
                engine,
                table: current.to_string(),
                source,
            });
        }
    };

    // Later inserts without explicit ids must not collide with the fixtures.
    for entity in &order {
        if let Some(column) = entity.identity_column() {
            let sql = dialect.restart_identity(entity.name, column.name);
            if let Err(e) = session.execute(&sql).await {
                tracing::warn!(engine = %engine, table = entity.name, error = %e, "identity not resynchronised");
            }
        }
    }

    tracing::info!(
        engine = %engine,
        rows = counts.total(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "seeded"
    );
    Ok(counts)
}
