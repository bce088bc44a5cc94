//! Class Tables
//!
//! Maps a model's raw output index to a disease name and the crop it belongs to.
//! Every table is fixed per model version and its indices run `0..N-1`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::CropParseError;

/// Supported crops.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropType {
    Apple,
    Corn,
    Potato,
    Tomato,
}

impl CropType {
    /// All crops in table order.
    pub const ALL: [CropType; 4] = [
        CropType::Apple,
        CropType::Corn,
        CropType::Potato,
        CropType::Tomato,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CropType::Apple => "apple",
            CropType::Corn => "corn",
            CropType::Potato => "potato",
            CropType::Tomato => "tomato",
        }
    }
}

impl fmt::Display for CropType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive, surrounding whitespace ignored.
impl FromStr for CropType {
    type Err = CropParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apple" => Ok(CropType::Apple),
            "corn" => Ok(CropType::Corn),
            "potato" => Ok(CropType::Potato),
            "tomato" => Ok(CropType::Tomato),
            _ => Err(CropParseError(s.to_owned())),
        }
    }
}

/// One row of a class table.
///
#[derive(Debug, Clone, PartialEq)]
pub struct ClassEntry {
    pub index: usize,
    pub disease_name: &'static str,
    pub crop_type: CropType,
}

impl ClassEntry {
    /// Whether the class denotes a healthy plant.
    pub fn is_healthy(&self) -> bool {
        self.disease_name.to_ascii_lowercase().contains("healthy")
    }
}

/// Output index -> class mapping for one model version.
///
#[derive(Debug, Clone, PartialEq)]
pub struct ClassTable {
    entries: Vec<ClassEntry>,
}

// Unified detector model, 16 classes across all crops.
const UNIFIED: [(&str, CropType); 16] = [
    ("Apple Scab", CropType::Apple),
    ("Apple Black Rot", CropType::Apple),
    ("Apple Cedar Rust", CropType::Apple),
    ("Apple Healthy", CropType::Apple),
    ("Corn Blight", CropType::Corn),
    ("Corn Common Rust", CropType::Corn),
    ("Corn Healthy", CropType::Corn),
    ("Potato Early Blight", CropType::Potato),
    ("Potato Late Blight", CropType::Potato),
    ("Potato Healthy", CropType::Potato),
    ("Tomato Bacterial Spot", CropType::Tomato),
    ("Tomato Early Blight", CropType::Tomato),
    ("Tomato Late Blight", CropType::Tomato),
    ("Tomato Leaf Mold", CropType::Tomato),
    ("Tomato Target Spot", CropType::Tomato),
    ("Tomato Healthy", CropType::Tomato),
];

// Per-crop classifier models, shared with the remote service.
const APPLE: [&str; 7] = [
    "Alternaria",
    "Insect",
    "MLB",
    "Mosaic",
    "Multiple",
    "Powdery Mildew",
    "Scab",
];
const CORN: [&str; 3] = ["Blight", "Common Rust", "Healthy"];
const POTATO: [&str; 3] = ["Early Blight", "Late Blight", "Healthy"];
const TOMATO: [&str; 6] = [
    "Bacterial Spot",
    "Early Blight",
    "Late Blight",
    "Leaf Mold",
    "Target Spot",
    "Healthy",
];

impl ClassTable {
    /// Table of the unified 16-class detector.
    pub fn unified() -> Self {
        Self {
            entries: UNIFIED
                .iter()
                .enumerate()
                .map(|(index, &(disease_name, crop_type))| ClassEntry {
                    index,
                    disease_name,
                    crop_type,
                })
                .collect(),
        }
    }

    /// Table of a crop-specific classifier.
    pub fn for_crop(crop: CropType) -> Self {
        let names: &[&'static str] = match crop {
            CropType::Apple => &APPLE,
            CropType::Corn => &CORN,
            CropType::Potato => &POTATO,
            CropType::Tomato => &TOMATO,
        };
        Self {
            entries: names
                .iter()
                .enumerate()
                .map(|(index, &disease_name)| ClassEntry {
                    index,
                    disease_name,
                    crop_type: crop,
                })
                .collect(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&ClassEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ClassEntry] {
        &self.entries
    }
}
