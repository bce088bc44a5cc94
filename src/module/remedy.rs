//! Remedy Resolver
//!
//! Static table from disease name to an ordered list of treatment tips. A miss
//! falls back to generic advice and never fails.

use std::collections::HashMap;

use super::classes::CropType;

/// Returned for any disease without a curated list.
pub const GENERIC_REMEDIES: [&str; 5] = [
    "Consult with a local agricultural extension service",
    "Remove and destroy infected plant parts",
    "Improve plant care practices (watering, fertilization)",
    "Monitor plants regularly for changes",
    "Consider using appropriate fungicides or pesticides as recommended",
];

const REMEDIES: [(&str, [&str; 5]); 15] = [
    // Apple
    (
        "Alternaria",
        [
            "Remove and destroy infected leaves and fruit",
            "Apply fungicides containing copper or mancozeb",
            "Improve air circulation by pruning",
            "Avoid overhead irrigation to reduce leaf wetness",
            "Apply preventive fungicide sprays before disease appears",
        ],
    ),
    (
        "Insect",
        [
            "Identify the specific insect pest for targeted treatment",
            "Use appropriate insecticides or biological controls",
            "Remove heavily infested plant parts",
            "Encourage beneficial insects like ladybugs",
            "Use sticky traps to monitor and control pests",
        ],
    ),
    (
        "MLB",
        [
            "Remove fallen leaves to reduce spore buildup",
            "Apply fungicides during early spring before symptoms appear",
            "Prune trees to improve air circulation",
            "Choose resistant apple varieties for future planting",
            "Apply protective fungicide sprays throughout growing season",
        ],
    ),
    (
        "Mosaic",
        [
            "Remove and destroy infected plants immediately",
            "Control aphid populations as they spread the virus",
            "Use virus-free planting material",
            "Keep area weed-free to eliminate virus reservoirs",
            "No chemical cure available, focus on prevention",
        ],
    ),
    (
        "Multiple",
        [
            "Consult with agricultural specialist for proper diagnosis",
            "Implement integrated disease management approach",
            "Improve overall plant health through proper nutrition",
            "Apply broad-spectrum fungicides as recommended",
            "Monitor plants closely and isolate affected areas",
        ],
    ),
    (
        "Powdery Mildew",
        [
            "Apply sulfur or potassium bicarbonate sprays",
            "Improve air circulation around plants",
            "Avoid overhead watering",
            "Remove infected plant parts",
            "Apply fungicides at first sign of disease",
        ],
    ),
    (
        "Scab",
        [
            "Apply fungicides during primary infection period",
            "Remove fallen leaves to reduce overwintering spores",
            "Prune for better air circulation",
            "Choose scab-resistant varieties",
            "Apply preventive fungicide sprays in early spring",
        ],
    ),
    // Corn
    (
        "Blight",
        [
            "Plant resistant corn hybrids",
            "Rotate crops with non-host plants",
            "Remove crop debris after harvest",
            "Apply fungicides if disease pressure is high",
            "Maintain proper plant spacing for air circulation",
        ],
    ),
    (
        "Common Rust",
        [
            "Plant resistant varieties",
            "Apply fungicides if infection is severe",
            "Monitor fields regularly for early detection",
            "Maintain good field sanitation",
            "Avoid excessive nitrogen fertilization",
        ],
    ),
    // Potato
    (
        "Early Blight",
        [
            "Apply fungicides containing chlorothalonil or mancozeb",
            "Remove infected leaves promptly",
            "Practice crop rotation with non-solanaceous crops",
            "Avoid overhead irrigation",
            "Apply mulch to prevent soil splash on leaves",
        ],
    ),
    (
        "Late Blight",
        [
            "Apply fungicides immediately (copper-based or systemic)",
            "Destroy infected plants to prevent spread",
            "Plant certified disease-free seed potatoes",
            "Improve air circulation",
            "Monitor weather conditions and spray preventively",
        ],
    ),
    // Tomato
    (
        "Bacterial Spot",
        [
            "Use disease-free seeds and transplants",
            "Apply copper-based bactericides",
            "Avoid overhead irrigation",
            "Remove and destroy infected plant material",
            "Practice crop rotation (3-4 years)",
        ],
    ),
    (
        "Leaf Mold",
        [
            "Improve air circulation and reduce humidity",
            "Apply fungicides containing chlorothalonil",
            "Remove infected leaves",
            "Avoid wetting foliage when watering",
            "Plant resistant varieties",
        ],
    ),
    (
        "Target Spot",
        [
            "Apply fungicides at first sign of disease",
            "Remove infected plant debris",
            "Improve air circulation",
            "Avoid overhead irrigation",
            "Practice crop rotation",
        ],
    ),
    (
        "Healthy",
        [
            "Continue regular monitoring for early disease detection",
            "Maintain proper watering and fertilization schedule",
            "Ensure good air circulation around plants",
            "Practice preventive measures like crop rotation",
            "Keep growing area clean and weed-free",
        ],
    ),
];

/// Lower case, single spaces.
fn normalize(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Resolves remedies by disease name.
///
#[derive(Debug, Clone)]
pub struct RemedyResolver {
    table: HashMap<String, &'static [&'static str]>,
}

impl Default for RemedyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl RemedyResolver {
    pub fn new() -> Self {
        let table = REMEDIES
            .iter()
            .map(|(name, remedies)| (normalize(name), &remedies[..]))
            .collect();
        Self { table }
    }

    /// Curated list for `disease_name`, or the generic fallback.
    ///
    /// Names from the unified detector carry a crop prefix ("Tomato Leaf Mold"),
    /// which is stripped when the full name has no entry.
    pub fn resolve(&self, disease_name: &str) -> Vec<String> {
        let key = normalize(disease_name);
        let hit = self.table.get(&key).or_else(|| {
            let (first, rest) = key.split_once(' ')?;
            first.parse::<CropType>().ok()?;
            self.table.get(rest)
        });
        match hit {
            Some(remedies) => remedies.iter().map(|r| r.to_string()).collect(),
            None => {
                log::debug!("No remedies for '{}', using generic advice", disease_name);
                GENERIC_REMEDIES.iter().map(|r| r.to_string()).collect()
            }
        }
    }

    /// Whether `disease_name` has a curated list.
    pub fn is_known(&self, disease_name: &str) -> bool {
        self.resolve(disease_name) != GENERIC_REMEDIES
    }
}
