//! Canonical obstacle classes.
//!
//! Ids are zero-based and follow the order used when the dataset was labelled:
//! `ch`=0 through `ve`=9. Any id outside the table maps to `class_<id>`.

use std::borrow::Cow;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObstacleClass {
    Chair,
    Door,
    Fence,
    GarbageBin,
    Obstacle,
    Plant,
    Pothole,
    Stair,
    Table,
    Vehicle,
}

impl ObstacleClass {
    pub const ALL: [ObstacleClass; 10] = [
        ObstacleClass::Chair,
        ObstacleClass::Door,
        ObstacleClass::Fence,
        ObstacleClass::GarbageBin,
        ObstacleClass::Obstacle,
        ObstacleClass::Plant,
        ObstacleClass::Pothole,
        ObstacleClass::Stair,
        ObstacleClass::Table,
        ObstacleClass::Vehicle,
    ];

    pub fn from_id(id: i64) -> Option<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
    }

    pub fn id(self) -> i64 {
        self as i64
    }

    /// Two-letter code the model was trained with.
    pub fn code(self) -> &'static str {
        match self {
            ObstacleClass::Chair => "ch",
            ObstacleClass::Door => "do",
            ObstacleClass::Fence => "fe",
            ObstacleClass::GarbageBin => "gb",
            ObstacleClass::Obstacle => "ob",
            ObstacleClass::Plant => "pl",
            ObstacleClass::Pothole => "po",
            ObstacleClass::Stair => "st",
            ObstacleClass::Table => "ta",
            ObstacleClass::Vehicle => "ve",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ObstacleClass::Chair => "chair",
            ObstacleClass::Door => "door",
            ObstacleClass::Fence => "fence",
            ObstacleClass::GarbageBin => "garbage bin",
            ObstacleClass::Obstacle => "obstacle",
            ObstacleClass::Plant => "plant",
            ObstacleClass::Pothole => "pothole",
            ObstacleClass::Stair => "stair",
            ObstacleClass::Table => "table",
            ObstacleClass::Vehicle => "vehicle",
        }
    }
}

/// Human-readable label for a raw class id. Never fails.
pub fn class_label(id: i64) -> Cow<'static, str> {
    match ObstacleClass::from_id(id) {
        Some(class) => Cow::Borrowed(class.code()),
        None => Cow::Owned(format!("class_{id}")),
    }
}
