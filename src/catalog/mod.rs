//! Schema graph consumed by the compiler.
//!
//! A [Catalog] is an immutable snapshot of the database catalog: entity
//! classes (tables) with attributes (columns), and links (directed arcs
//! derived from foreign keys). The compiler never mutates it; a snapshot is
//! taken once per compile call.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId(pub usize);

/// Scalar type of an attribute or expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    /// A literal whose type is pinned by context.
    Untyped,
    Boolean,
    Integer,
    Decimal,
    Float,
    Text,
    Date,
    Time,
    DateTime,
    Enum(Vec<String>),
    /// A column the compiler can carry around but not operate on.
    Opaque,
    /// A record of some flow; not a scalar.
    Record,
    Void,
}

impl Domain {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Domain::Integer | Domain::Decimal | Domain::Float)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, Domain::Date | Domain::Time | Domain::DateTime)
    }

    pub fn is_orderable(&self) -> bool {
        matches!(
            self,
            Domain::Untyped
                | Domain::Integer
                | Domain::Decimal
                | Domain::Float
                | Domain::Text
                | Domain::Date
                | Domain::Time
                | Domain::DateTime
                | Domain::Enum(_)
        )
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Domain::Record | Domain::Void)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Domain::Untyped => "untyped",
            Domain::Boolean => "boolean",
            Domain::Integer => "integer",
            Domain::Decimal => "decimal",
            Domain::Float => "float",
            Domain::Text => "text",
            Domain::Date => "date",
            Domain::Time => "time",
            Domain::DateTime => "datetime",
            Domain::Enum(_) => "enum",
            Domain::Opaque => "opaque",
            Domain::Record => "record",
            Domain::Void => "void",
        }
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub domain: Domain,
    pub nullable: bool,
}

/// A directed arc between two entity classes, derived from a foreign key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    pub name: String,
    pub origin: ClassId,
    pub target: ClassId,
    /// At most one target row per origin row.
    pub singular: bool,
    /// At least one target row per origin row.
    pub total: bool,
    pub unique: bool,
    /// Join predicate: pairwise equality of these attribute positions.
    pub origin_columns: Vec<usize>,
    pub target_columns: Vec<usize>,
}

impl Link {
    pub fn is_plural(&self) -> bool {
        !self.singular
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityClass {
    pub id: ClassId,
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub primary_key: Vec<usize>,
    pub unique_keys: Vec<Vec<usize>>,
    pub links: Vec<LinkId>,
}

impl EntityClass {
    /// Case-insensitive attribute lookup.
    pub fn attribute(&self, name: &str) -> Option<(usize, &Attribute)> {
        self.attributes
            .iter()
            .enumerate()
            .find(|(_, a)| a.name.eq_ignore_ascii_case(name))
    }
}

/// Read-only snapshot of the entity-link graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    classes: Vec<EntityClass>,
    links: Vec<Link>,
    by_name: HashMap<String, ClassId>,
    version: u64,
}

impl Catalog {
    pub fn entities(&self) -> impl Iterator<Item = &EntityClass> {
        self.classes.iter()
    }

    /// Case-insensitive entity lookup.
    pub fn entity(&self, name: &str) -> Option<&EntityClass> {
        self.by_name
            .get(&name.to_lowercase())
            .map(|id| &self.classes[id.0])
    }

    pub fn class(&self, id: ClassId) -> &EntityClass {
        &self.classes[id.0]
    }

    pub fn attributes(&self, id: ClassId) -> &[Attribute] {
        &self.classes[id.0].attributes
    }

    pub fn links(&self, id: ClassId) -> impl Iterator<Item = &Link> {
        self.classes[id.0].links.iter().map(|l| &self.links[l.0])
    }

    /// Case-insensitive link lookup within an entity's namespace.
    pub fn link_of(&self, id: ClassId, name: &str) -> Option<&Link> {
        self.links(id).find(|l| l.name.eq_ignore_ascii_case(name))
    }

    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id.0]
    }

    pub fn primary_key(&self, id: ClassId) -> &[usize] {
        &self.classes[id.0].primary_key
    }

    pub fn unique_keys(&self, id: ClassId) -> &[Vec<usize>] {
        &self.classes[id.0].unique_keys
    }

    /// Structural fingerprint of the snapshot, for embedder-owned caches.
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Assembles a [Catalog] snapshot; the usual implementation source is the
/// database introspection layer.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    entities: Vec<EntityBuilder>,
    foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug)]
pub struct EntityBuilder {
    name: String,
    columns: Vec<Attribute>,
    primary_key: Vec<String>,
    unique_keys: Vec<Vec<String>>,
}

#[derive(Debug)]
struct ForeignKey {
    origin: String,
    columns: Vec<String>,
    target: String,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&mut self, name: &str) -> &mut EntityBuilder {
        self.entities.push(EntityBuilder {
            name: name.to_string(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            unique_keys: Vec::new(),
        });
        self.entities.last_mut().unwrap()
    }

    /// Registers a foreign key referencing the target's primary key. Induces
    /// a forward singular link named after the target and a reverse link
    /// named after the origin.
    pub fn foreign_key(&mut self, origin: &str, columns: &[&str], target: &str) -> &mut Self {
        self.foreign_keys.push(ForeignKey {
            origin: origin.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            target: target.to_string(),
        });
        self
    }

    pub fn build(self) -> Result<Catalog, Error> {
        let mut classes = Vec::new();
        let mut by_name = HashMap::new();

        for (index, entity) in self.entities.iter().enumerate() {
            let id = ClassId(index);
            let lowered = entity.name.to_lowercase();
            if by_name.insert(lowered, id).is_some() {
                return Err(Error::new_simple(format!(
                    "duplicate entity `{}`",
                    entity.name
                )));
            }

            let mut seen = HashMap::new();
            for (position, column) in entity.columns.iter().enumerate() {
                if seen.insert(column.name.to_lowercase(), position).is_some() {
                    return Err(Error::new_simple(format!(
                        "duplicate attribute `{}` in `{}`",
                        column.name, entity.name
                    )));
                }
            }

            let resolve = |names: &[String]| -> Result<Vec<usize>, Error> {
                names
                    .iter()
                    .map(|n| {
                        seen.get(&n.to_lowercase()).copied().ok_or_else(|| {
                            Error::new_simple(format!(
                                "unknown column `{n}` in `{}`",
                                entity.name
                            ))
                        })
                    })
                    .collect()
            };

            let primary_key = resolve(&entity.primary_key)?;
            let unique_keys = entity
                .unique_keys
                .iter()
                .map(|k| resolve(k))
                .collect::<Result<Vec<_>, _>>()?;

            classes.push(EntityClass {
                id,
                name: entity.name.clone(),
                attributes: entity.columns.clone(),
                primary_key,
                unique_keys,
                links: Vec::new(),
            });
        }

        let mut links = Vec::new();
        for fk in &self.foreign_keys {
            let origin = *by_name
                .get(&fk.origin.to_lowercase())
                .ok_or_else(|| Error::new_simple(format!("unknown entity `{}`", fk.origin)))?;
            let target = *by_name
                .get(&fk.target.to_lowercase())
                .ok_or_else(|| Error::new_simple(format!("unknown entity `{}`", fk.target)))?;

            let origin_columns = fk
                .columns
                .iter()
                .map(|n| {
                    classes[origin.0]
                        .attribute(n)
                        .map(|(i, _)| i)
                        .ok_or_else(|| {
                            Error::new_simple(format!("unknown column `{n}` in `{}`", fk.origin))
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let target_columns = classes[target.0].primary_key.clone();
            if target_columns.len() != origin_columns.len() {
                return Err(Error::new_simple(format!(
                    "foreign key `{}` does not match the primary key of `{}`",
                    fk.origin, fk.target
                )));
            }

            let total = origin_columns
                .iter()
                .all(|c| !classes[origin.0].attributes[*c].nullable);
            let unique = classes[origin.0].primary_key == origin_columns
                || classes[origin.0].unique_keys.contains(&origin_columns);

            let forward = LinkId(links.len());
            links.push(Link {
                id: forward,
                name: classes[target.0].name.clone(),
                origin,
                target,
                singular: true,
                total,
                unique,
                origin_columns: origin_columns.clone(),
                target_columns: target_columns.clone(),
            });
            classes[origin.0].links.push(forward);

            let reverse = LinkId(links.len());
            links.push(Link {
                id: reverse,
                name: classes[origin.0].name.clone(),
                origin: target,
                target: origin,
                singular: unique,
                total: false,
                unique: true,
                origin_columns: target_columns,
                target_columns: origin_columns,
            });
            classes[target.0].links.push(reverse);
        }

        let version = fingerprint(&classes, &links);
        Ok(Catalog {
            classes,
            links,
            by_name,
            version,
        })
    }
}

impl EntityBuilder {
    pub fn column(&mut self, name: &str, domain: Domain) -> &mut Self {
        self.columns.push(Attribute {
            name: name.to_string(),
            domain,
            nullable: false,
        });
        self
    }

    pub fn nullable(&mut self, name: &str, domain: Domain) -> &mut Self {
        self.columns.push(Attribute {
            name: name.to_string(),
            domain,
            nullable: true,
        });
        self
    }

    pub fn primary_key(&mut self, columns: &[&str]) -> &mut Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn unique(&mut self, columns: &[&str]) -> &mut Self {
        self.unique_keys
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }
}

fn fingerprint(classes: &[EntityClass], links: &[Link]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for class in classes {
        class.name.hash(&mut hasher);
        for attribute in &class.attributes {
            attribute.name.hash(&mut hasher);
            attribute.domain.hash(&mut hasher);
            attribute.nullable.hash(&mut hasher);
        }
        class.primary_key.hash(&mut hasher);
        class.unique_keys.hash(&mut hasher);
    }
    for link in links {
        link.name.hash(&mut hasher);
        link.origin.hash(&mut hasher);
        link.target.hash(&mut hasher);
        link.origin_columns.hash(&mut hasher);
        link.target_columns.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
pub(crate) mod fixture {
    use super::*;

    /// The sample university catalog used across the test suite.
    pub(crate) fn university() -> Catalog {
        let mut builder = CatalogBuilder::new();

        builder
            .entity("school")
            .column("code", Domain::Text)
            .column("name", Domain::Text)
            .nullable("campus", Domain::Text)
            .primary_key(&["code"]);

        builder
            .entity("department")
            .column("code", Domain::Text)
            .column("name", Domain::Text)
            .nullable("school_code", Domain::Text)
            .primary_key(&["code"]);

        builder
            .entity("program")
            .column("school_code", Domain::Text)
            .column("code", Domain::Text)
            .column("title", Domain::Text)
            .column(
                "degree",
                Domain::Enum(
                    ["ba", "bs", "ct", "ma", "ms", "ph"]
                        .iter()
                        .map(|d| d.to_string())
                        .collect(),
                ),
            )
            .primary_key(&["school_code", "code"]);

        builder
            .entity("course")
            .column("department_code", Domain::Text)
            .column("no", Domain::Integer)
            .column("title", Domain::Text)
            .nullable("credits", Domain::Integer)
            .nullable("description", Domain::Text)
            .primary_key(&["department_code", "no"]);

        builder.foreign_key("department", &["school_code"], "school");
        builder.foreign_key("program", &["school_code"], "school");
        builder.foreign_key("course", &["department_code"], "department");

        builder.build().unwrap()
    }

    #[test]
    fn test_links_from_foreign_keys() {
        let catalog = university();
        let school = catalog.entity("school").unwrap();
        let department = catalog.entity("department").unwrap();

        let forward = catalog.link_of(department.id, "school").unwrap();
        assert!(forward.singular);
        assert!(!forward.total);
        assert_eq!(forward.target, school.id);

        let reverse = catalog.link_of(school.id, "department").unwrap();
        assert!(reverse.is_plural());
        assert_eq!(reverse.target, department.id);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let catalog = university();
        assert!(catalog.entity("SCHOOL").is_some());
        let school = catalog.entity("school").unwrap();
        assert!(school.attribute("CAMPUS").is_some());
    }
}
