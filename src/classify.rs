use serde::{Deserialize, Serialize};

/// Domain category of a detection that survived classification.
///
/// There is no "other" variant: detections the mapper cannot place are
/// dropped before they are ever wrapped in a `ClassifiedDetection`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainClass {
    ExitMarker,
    Obstruction,
}

/// Outcome of mapping one native detector label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Domain(DomainClass),
    Unclassified,
}

impl Classification {
    pub fn domain(self) -> Option<DomainClass> {
        match self {
            Classification::Domain(class) => Some(class),
            Classification::Unclassified => None,
        }
    }
}

const EXIT_MARKER_LABELS: &[&str] = &[
    "exit",
    "exit sign",
    "emergency exit",
    "exit door",
    "emergency door",
    "fire exit",
];

const OBSTRUCTION_LABELS: &[&str] = &[
    "obstruction",
    "box",
    "pallet",
    "machinery",
    "person",
    "chair",
    "cart",
    "trolley",
    "forklift",
    "ladder",
    "bin",
    "crate",
    "barrel",
    "cone",
    "furniture",
    "equipment",
];

/// Maps a detector's native label vocabulary onto the two domain classes.
pub struct ClassMapper;

impl ClassMapper {
    /// Case-insensitive lookup; `_` and `-` count as spaces.
    pub fn map(native_label: &str) -> Classification {
        let label = normalize_label(native_label);
        if EXIT_MARKER_LABELS.contains(&label.as_str()) {
            Classification::Domain(DomainClass::ExitMarker)
        } else if OBSTRUCTION_LABELS.contains(&label.as_str()) {
            Classification::Domain(DomainClass::Obstruction)
        } else {
            Classification::Unclassified
        }
    }
}

fn normalize_label(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| match c {
            '_' | '-' => ' ',
            other => other.to_ascii_lowercase(),
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
