//! The shared entity model pushed to both engines.
//!
//! Names are canonical lowercase identifiers. Dialects fold and quote them
//! when rendering DDL, so the same name resolves on either engine.

/// Logical column types, mapped to native types by each dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text(u32),
    Date,
    Timestamp,
    Interval,
    Money { precision: u8, scale: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    /// Surrogate key filled by the engine when no value is given.
    pub identity: bool,
}

impl Column {
    const fn new(name: &'static str, ty: ColumnType, nullable: bool) -> Self {
        Self {
            name,
            ty,
            nullable,
            identity: false,
        }
    }

    const fn identity(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Integer,
            nullable: false,
            identity: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    /// Constraint name, short enough for Oracle's identifier limit.
    pub name: &'static str,
    pub column: &'static str,
    pub references: &'static str,
    pub referenced_column: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    /// Written with unquoted canonical names so both engines fold them.
    pub expression: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entity {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub primary_key: &'static [&'static str],
    pub foreign_keys: &'static [ForeignKey],
    pub checks: &'static [Check],
}

impl Entity {
    /// Identity column, if the entity has one.
    pub fn identity_column(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.identity)
    }

    pub fn primary_key_name(&self) -> String {
        format!("pk_{}", self.name)
    }

    pub fn depends_on(&self, other: &str) -> bool {
        self.foreign_keys
            .iter()
            .any(|fk| fk.references == other && fk.references != self.name)
    }
}

/// An ordered set of entities. Declaration order breaks ties when sorting by
/// dependency.
#[derive(Debug, Clone)]
pub struct Model {
    entities: Vec<Entity>,
}

impl Model {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self { entities }
    }

    /// The festival schema every harness run works against.
    pub fn festival() -> Self {
        Self::new(FESTIVAL.to_vec())
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Entities ordered so every table comes after the tables it references.
    ///
    /// Stable with respect to declaration order. Returns the names of the
    /// tables left over when the foreign keys form a cycle, or the first
    /// unknown table a foreign key points at.
    pub fn creation_order(&self) -> Result<Vec<&Entity>, String> {
        for entity in &self.entities {
            for fk in entity.foreign_keys {
                if self.entity(fk.references).is_none() {
                    return Err(format!(
                        "{}.{} references unknown table {}",
                        entity.name, fk.column, fk.references
                    ));
                }
            }
        }

        let mut placed: Vec<&Entity> = Vec::with_capacity(self.entities.len());
        let mut remaining: Vec<&Entity> = self.entities.iter().collect();

        while !remaining.is_empty() {
            let ready = remaining.iter().position(|candidate| {
                remaining
                    .iter()
                    .all(|other| other.name == candidate.name || !candidate.depends_on(other.name))
            });
            match ready {
                Some(idx) => placed.push(remaining.remove(idx)),
                None => {
                    let names: Vec<&str> = remaining.iter().map(|e| e.name).collect();
                    return Err(format!("foreign key cycle between {}", names.join(", ")));
                }
            }
        }
        Ok(placed)
    }
}

use ColumnType::*;

const GROUPE: Entity = Entity {
    name: "groupe",
    columns: &[
        Column::identity("id_groupe"),
        Column::new("nom_groupe", Text(255), false),
        Column::new("style", Text(100), true),
        Column::new("pays_origine", Text(100), true),
        Column::new("nb_membres", Integer, true),
    ],
    primary_key: &["id_groupe"],
    foreign_keys: &[],
    checks: &[],
};

const SCENE: Entity = Entity {
    name: "scene",
    columns: &[
        Column::identity("id_scene"),
        Column::new("nom_scene", Text(255), false),
        Column::new("emplacement", Text(255), true),
        Column::new("capacite", Integer, true),
    ],
    primary_key: &["id_scene"],
    foreign_keys: &[],
    checks: &[],
};

const CONCERT: Entity = Entity {
    name: "concert",
    columns: &[
        Column::identity("id_concert"),
        Column::new("date_concert", Date, true),
        Column::new("heure_debut", Timestamp, true),
        Column::new("duree", Interval, true),
        Column::new("id_scene", Integer, false),
        Column::new("id_groupe", Integer, false),
    ],
    primary_key: &["id_concert"],
    foreign_keys: &[
        ForeignKey {
            name: "fk_concert_id_scene_scene",
            column: "id_scene",
            references: "scene",
            referenced_column: "id_scene",
        },
        ForeignKey {
            name: "fk_concert_id_groupe_groupe",
            column: "id_groupe",
            references: "groupe",
            referenced_column: "id_groupe",
        },
    ],
    checks: &[],
};

const BENEVOLE: Entity = Entity {
    name: "benevole",
    columns: &[
        Column::identity("id_benevole"),
        Column::new("nom", Text(100), false),
        Column::new("prenom", Text(100), false),
        Column::new("telephone", Text(50), true),
        Column::new("email", Text(255), true),
        Column::new("poste", Text(100), true),
    ],
    primary_key: &["id_benevole"],
    foreign_keys: &[],
    checks: &[],
};

const AFFECTATION: Entity = Entity {
    name: "affectation",
    columns: &[
        Column::new("id_benevole", Integer, false),
        Column::new("id_concert", Integer, false),
        Column::new("role", Text(100), true),
    ],
    primary_key: &["id_benevole", "id_concert"],
    foreign_keys: &[
        ForeignKey {
            name: "fk_affect_id_benevole_benevole",
            column: "id_benevole",
            references: "benevole",
            referenced_column: "id_benevole",
        },
        ForeignKey {
            name: "fk_affect_id_concert_concert",
            column: "id_concert",
            references: "concert",
            referenced_column: "id_concert",
        },
    ],
    checks: &[],
};

const PARTENAIRE: Entity = Entity {
    name: "partenaire",
    columns: &[
        Column::identity("id_partenaire"),
        Column::new("nom_partenaire", Text(255), false),
        Column::new("type_partenaire", Text(100), true),
    ],
    primary_key: &["id_partenaire"],
    foreign_keys: &[],
    checks: &[],
};

const SPONSORING: Entity = Entity {
    name: "sponsoring",
    columns: &[
        Column::new("id_partenaire", Integer, false),
        Column::new("id_concert", Integer, false),
        Column::new(
            "montant",
            Money {
                precision: 12,
                scale: 2,
            },
            true,
        ),
    ],
    primary_key: &["id_partenaire", "id_concert"],
    foreign_keys: &[
        ForeignKey {
            name: "fk_sponsor_id_part_partenaire",
            column: "id_partenaire",
            references: "partenaire",
            referenced_column: "id_partenaire",
        },
        ForeignKey {
            name: "fk_sponsor_id_concert_concert",
            column: "id_concert",
            references: "concert",
            referenced_column: "id_concert",
        },
    ],
    checks: &[Check {
        name: "ck_sponsoring_montant",
        expression: "montant >= 0",
    }],
};

const FESTIVAL: [Entity; 7] = [
    GROUPE,
    SCENE,
    CONCERT,
    BENEVOLE,
    AFFECTATION,
    PARTENAIRE,
    SPONSORING,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn names(entities: &[&Entity]) -> Vec<&'static str> {
        entities.iter().map(|e| e.name).collect()
    }

    #[test]
    fn test_festival_creation_order() {
        let model = Model::festival();
        let order = model.creation_order().unwrap();
        assert_eq!(
            names(&order),
            vec![
                "groupe",
                "scene",
                "concert",
                "benevole",
                "affectation",
                "partenaire",
                "sponsoring"
            ]
        );
    }

    #[test]
    fn test_order_moves_dependents_after_parents() {
        let model = Model::new(vec![SPONSORING, AFFECTATION, CONCERT, PARTENAIRE, BENEVOLE, SCENE, GROUPE]);
        let order = names(&model.creation_order().unwrap());
        let pos = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(pos("scene") < pos("concert"));
        assert!(pos("groupe") < pos("concert"));
        assert!(pos("concert") < pos("affectation"));
        assert!(pos("benevole") < pos("affectation"));
        assert!(pos("partenaire") < pos("sponsoring"));
        // Stable: independent tables keep declaration order
        assert!(pos("partenaire") < pos("benevole"));
    }

    #[test]
    fn test_cycle_is_reported() {
        const A: Entity = Entity {
            name: "a",
            columns: &[Column::new("b_id", Integer, false)],
            primary_key: &[],
            foreign_keys: &[ForeignKey {
                name: "fk_a_b",
                column: "b_id",
                references: "b",
                referenced_column: "id",
            }],
            checks: &[],
        };
        const B: Entity = Entity {
            name: "b",
            columns: &[Column::new("a_id", Integer, false)],
            primary_key: &[],
            foreign_keys: &[ForeignKey {
                name: "fk_b_a",
                column: "a_id",
                references: "a",
                referenced_column: "id",
            }],
            checks: &[],
        };
        let err = Model::new(vec![GROUPE, A, B]).creation_order().unwrap_err();
        assert_eq!(err, "foreign key cycle between a, b");
    }

    #[test]
    fn test_unknown_reference_is_reported() {
        let err = Model::new(vec![CONCERT, GROUPE]).creation_order().unwrap_err();
        assert!(err.contains("unknown table scene"));
    }

    #[test]
    fn test_constraint_names_fit_oracle_limit() {
        for entity in Model::festival().entities() {
            assert!(entity.primary_key_name().len() <= 30);
            for fk in entity.foreign_keys {
                assert!(fk.name.len() <= 30, "{} too long", fk.name);
            }
        }
    }

    #[test]
    fn test_junction_tables_have_no_identity() {
        let model = Model::festival();
        assert!(model.entity("affectation").unwrap().identity_column().is_none());
        assert!(model.entity("sponsoring").unwrap().identity_column().is_none());
        assert_eq!(
            model.entity("groupe").unwrap().identity_column().map(|c| c.name),
            Some("id_groupe")
        );
    }
}
