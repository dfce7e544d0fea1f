//! Relationship declarations between resources

use crate::error::{EngineError, EngineResult};
use crate::selection::OrderBy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationshipKind {
    /// One-to-many: children carry `foreign_key` pointing at the parent
    HasMany,
    /// Many-to-one: the parent carries `foreign_key` pointing at the target
    BelongsTo,
    /// One-to-one: the target carries `foreign_key` pointing at the parent
    HasOne,
    /// Many-to-many through a join table
    ManyToMany,
}

impl RelationshipKind {
    /// Returns true if this relationship yields a list
    pub fn is_collection(self) -> bool {
        matches!(self, Self::HasMany | Self::ManyToMany)
    }

    pub fn cardinality(self) -> Cardinality {
        if self.is_collection() {
            Cardinality::Many
        } else {
            Cardinality::One
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::HasMany => "hasMany",
            Self::BelongsTo => "belongsTo",
            Self::HasOne => "hasOne",
            Self::ManyToMany => "manyToMany",
        }
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a traversal produces a single value or a list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    Many,
}

/// Join table used by `hasMany ... through` relationships
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Through {
    /// Join table (or resource) name
    pub table: String,
    /// Column of the join row that points at the target
    pub target_foreign_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Relationship {
    HasMany {
        target: String,
        foreign_key: String,
        order_by: Option<OrderBy>,
        through: Option<Through>,
    },
    BelongsTo {
        target: String,
        foreign_key: String,
    },
    HasOne {
        target: String,
        foreign_key: String,
    },
    ManyToMany {
        target: String,
        foreign_key: String,
        through: String,
        target_foreign_key: String,
    },
}

impl Relationship {
    pub fn has_many(target: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self::HasMany {
            target: target.into(),
            foreign_key: foreign_key.into(),
            order_by: None,
            through: None,
        }
    }

    pub fn belongs_to(target: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self::BelongsTo {
            target: target.into(),
            foreign_key: foreign_key.into(),
        }
    }

    pub fn has_one(target: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self::HasOne {
            target: target.into(),
            foreign_key: foreign_key.into(),
        }
    }

    /// `foreign_key` points at the parent and `target_foreign_key` at the
    /// target, both on rows of the `through` table
    pub fn many_to_many(
        target: impl Into<String>,
        through: impl Into<String>,
        foreign_key: impl Into<String>,
        target_foreign_key: impl Into<String>,
    ) -> Self {
        Self::ManyToMany {
            target: target.into(),
            foreign_key: foreign_key.into(),
            through: through.into(),
            target_foreign_key: target_foreign_key.into(),
        }
    }

    /// Default ordering of a `hasMany` list. No effect on other kinds.
    pub fn ordered_by(mut self, order: OrderBy) -> Self {
        if let Self::HasMany { order_by, .. } = &mut self {
            *order_by = Some(order);
        }
        self
    }

    /// Routes a `hasMany` through a join table. No effect on other kinds.
    pub fn through(mut self, table: impl Into<String>, target_foreign_key: impl Into<String>) -> Self {
        if let Self::HasMany { through, .. } = &mut self {
            *through = Some(Through {
                table: table.into(),
                target_foreign_key: target_foreign_key.into(),
            });
        }
        self
    }

    pub fn kind(&self) -> RelationshipKind {
        match self {
            Self::HasMany { .. } => RelationshipKind::HasMany,
            Self::BelongsTo { .. } => RelationshipKind::BelongsTo,
            Self::HasOne { .. } => RelationshipKind::HasOne,
            Self::ManyToMany { .. } => RelationshipKind::ManyToMany,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Self::HasMany { target, .. }
            | Self::BelongsTo { target, .. }
            | Self::HasOne { target, .. }
            | Self::ManyToMany { target, .. } => target,
        }
    }

    pub fn foreign_key(&self) -> &str {
        match self {
            Self::HasMany { foreign_key, .. }
            | Self::BelongsTo { foreign_key, .. }
            | Self::HasOne { foreign_key, .. }
            | Self::ManyToMany { foreign_key, .. } => foreign_key,
        }
    }

    pub fn order_by(&self) -> Option<&OrderBy> {
        match self {
            Self::HasMany { order_by, .. } => order_by.as_ref(),
            _ => None,
        }
    }

    pub fn cardinality(&self) -> Cardinality {
        self.kind().cardinality()
    }

    /// Checks the declaration is complete
    pub fn validate(&self, resource: &str, name: &str) -> EngineResult<()> {
        let blank = |value: &str| value.trim().is_empty();

        if blank(name) {
            return Err(EngineError::registration(resource, "relationship name cannot be empty"));
        }
        if blank(self.target()) {
            return Err(EngineError::registration(
                resource,
                format!("relationship '{}' has no target", name),
            ));
        }
        if blank(self.foreign_key()) {
            return Err(EngineError::registration(
                resource,
                format!("relationship '{}' has no foreign key", name),
            ));
        }

        match self {
            Self::ManyToMany {
                through,
                target_foreign_key,
                ..
            } => {
                if blank(through) || blank(target_foreign_key) {
                    return Err(EngineError::registration(
                        resource,
                        format!("manyToMany relationship '{}' requires a join table and target key", name),
                    ));
                }
            }
            Self::HasMany {
                through: Some(through),
                ..
            } => {
                if blank(&through.table) || blank(&through.target_foreign_key) {
                    return Err(EngineError::registration(
                        resource,
                        format!("relationship '{}' has an incomplete join table", name),
                    ));
                }
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_cardinality() {
        assert!(RelationshipKind::HasMany.is_collection());
        assert!(RelationshipKind::ManyToMany.is_collection());
        assert!(!RelationshipKind::BelongsTo.is_collection());
        assert_eq!(RelationshipKind::HasOne.cardinality(), Cardinality::One);
    }

    #[test]
    fn test_modifiers_only_apply_to_has_many() {
        let rel = Relationship::belongs_to("user", "authorId").ordered_by(OrderBy::asc("name"));
        assert_eq!(rel.order_by(), None);

        let rel = Relationship::has_many("message", "conversationId")
            .ordered_by(OrderBy::asc("createdAt"))
            .through("conversation_messages", "messageId");
        assert_eq!(rel.order_by(), Some(&OrderBy::asc("createdAt")));
        assert!(matches!(rel, Relationship::HasMany { through: Some(_), .. }));
    }

    #[test]
    fn test_validate_rejects_incomplete() {
        assert!(Relationship::has_many("", "fk").validate("post", "comments").is_err());
        assert!(Relationship::has_many("comment", " ").validate("post", "comments").is_err());
        assert!(Relationship::many_to_many("tag", "", "postId", "tagId")
            .validate("post", "tags")
            .is_err());
        assert!(Relationship::many_to_many("tag", "post_tags", "postId", "tagId")
            .validate("post", "tags")
            .is_ok());
    }
}
