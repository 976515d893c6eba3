//! Static domain tables: calibration anchors, the discrete-item volume
//! catalogue, surcharge membership, device crop factors and label sets.
//! Everything here is pure data behind typed lookups.

use serde::Serialize;

/// Objects with a well-known real-world size, used to resolve image scale
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnchorKind {
    Door,
    Tire,
    TrashBin,
    Person,
    Chair,
    Bucket,
}

impl AnchorKind {
    /// Matches a lowercased detector label against the anchor registry
    pub fn from_label(label: &str) -> Option<Self> {
        if label.contains("door") {
            Some(AnchorKind::Door)
        } else if label.contains("tire") {
            Some(AnchorKind::Tire)
        } else if label.contains("trash can") || label.contains("trash bin") || label.contains("bin") {
            Some(AnchorKind::TrashBin)
        } else if label.contains("person") {
            Some(AnchorKind::Person)
        } else if label.contains("chair") {
            Some(AnchorKind::Chair)
        } else if label.contains("bucket") {
            Some(AnchorKind::Bucket)
        } else {
            None
        }
    }

    /// Known real-world size in meters
    pub fn expected_size_m(self) -> f32 {
        match self {
            AnchorKind::Door => 2.03,
            AnchorKind::Person => 1.68,
            AnchorKind::TrashBin => 0.90,
            AnchorKind::Tire => 0.60,
            AnchorKind::Chair => 0.45,
            AnchorKind::Bucket => 0.30,
        }
    }

    /// Lower rank is more trusted when sorting anchor measurements
    pub fn trust_rank(self) -> u8 {
        match self {
            AnchorKind::Door => 0,
            AnchorKind::Tire => 1,
            AnchorKind::TrashBin => 2,
            AnchorKind::Person => 3,
            AnchorKind::Chair => 4,
            AnchorKind::Bucket => 5,
        }
    }
}

/// Labels that get priority treatment in billing
const HIGH_VALUE_ITEMS: &[&str] = &[
    "sofa", "couch", "refrigerator", "fridge", "washer", "dryer",
    "mattress", "bed", "dresser", "bookshelf", "desk", "table",
    "chair", "armchair", "tv", "television", "microwave", "oven",
    "dishwasher", "treadmill", "elliptical",
];

pub fn is_high_value(label: &str) -> bool {
    HIGH_VALUE_ITEMS.iter().any(|hv| label.contains(hv))
}

/// Catalogued volume in cubic yards for a lowercased label.
/// Multi-word entries are checked before their generic substrings.
pub fn catalog_volume_cy(label: &str) -> Option<f64> {
    const ENTRIES: &[(&str, f64)] = &[
        ("king mattress", 1.5),
        ("queen mattress", 1.2),
        ("twin mattress", 0.8),
        ("bed frame", 0.8),
        ("dining table", 1.0),
        ("exercise bike", 0.8),
        ("hot tub", 4.0),
        ("loveseat", 1.5),
        ("sofa", 2.0),
        ("couch", 2.0),
        ("refrigerator", 2.0),
        ("fridge", 2.0),
        ("washer", 1.2),
        ("dryer", 1.2),
        ("mattress", 1.2),
        ("dresser", 1.0),
        ("bookshelf", 1.0),
        ("desk", 0.8),
        ("armchair", 0.5),
        ("recliner", 0.8),
        ("chair", 0.3),
        ("table", 0.6),
        ("television", 0.3),
        ("tv", 0.3),
        ("microwave", 0.15),
        ("oven", 0.8),
        ("dishwasher", 1.0),
        ("treadmill", 1.5),
        ("elliptical", 1.5),
        ("piano", 3.0),
    ];

    ENTRIES
        .iter()
        .find(|(key, _)| label.contains(key))
        .map(|(_, cy)| *cy)
}

/// Billing surcharges stamped onto line items
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Surcharge {
    Heavy,
    EWaste,
    TwoPersonLift,
    Hazmat,
    HeavyMaterial,
}

impl Surcharge {
    pub fn as_str(self) -> &'static str {
        match self {
            Surcharge::Heavy => "heavy",
            Surcharge::EWaste => "e_waste",
            Surcharge::TwoPersonLift => "two_person_lift",
            Surcharge::Hazmat => "hazmat",
            Surcharge::HeavyMaterial => "heavy_material",
        }
    }
}

const HEAVY_ITEMS: &[&str] = &[
    "piano", "hot tub", "treadmill", "elliptical", "washer", "dryer", "oven",
];

const EWASTE_ITEMS: &[&str] = &["tv", "television", "microwave", "monitor", "computer"];

const TWO_PERSON_ITEMS: &[&str] = &[
    "sofa", "couch", "refrigerator", "fridge", "piano", "hot tub",
    "washer", "dryer", "treadmill", "dresser", "mattress",
];

const HAZMAT_ITEMS: &[&str] = &["refrigerator", "fridge", "freezer"];

/// Surcharges applicable to a catalogued label, in stable order
pub fn surcharges_for(label: &str) -> Vec<Surcharge> {
    let mut out = Vec::new();
    if HEAVY_ITEMS.iter().any(|k| label.contains(k)) {
        out.push(Surcharge::Heavy);
    }
    if EWASTE_ITEMS.iter().any(|k| label.contains(k)) {
        out.push(Surcharge::EWaste);
    }
    if TWO_PERSON_ITEMS.iter().any(|k| label.contains(k)) {
        out.push(Surcharge::TwoPersonLift);
    }
    if HAZMAT_ITEMS.iter().any(|k| label.contains(k)) {
        out.push(Surcharge::Hazmat);
    }
    out
}

/// Device families with known sensor crop factors for deriving a 35mm
/// equivalent focal length from the physical one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceFamily {
    Iphone12,
    Iphone13,
    Iphone14,
    Iphone15,
}

impl DeviceFamily {
    pub fn from_model(model: &str) -> Option<Self> {
        let m = model.to_lowercase();
        if m.contains("iphone 12") {
            Some(DeviceFamily::Iphone12)
        } else if m.contains("iphone 13") {
            Some(DeviceFamily::Iphone13)
        } else if m.contains("iphone 14") {
            Some(DeviceFamily::Iphone14)
        } else if m.contains("iphone 15") {
            Some(DeviceFamily::Iphone15)
        } else {
            None
        }
    }

    /// Main-lens crop factor relative to full frame
    pub fn crop_factor(self) -> f32 {
        match self {
            DeviceFamily::Iphone12 => 5.1,
            DeviceFamily::Iphone13 => 4.8,
            DeviceFamily::Iphone14 => 4.5,
            DeviceFamily::Iphone15 => 4.3,
        }
    }
}

/// Text prompts for the bulk segmenter
pub const BULK_PROMPTS: &[&str] = &[
    "pile of junk",
    "debris pile",
    "garbage bags",
    "cardboard boxes",
    "mixed waste",
    "yard waste",
    "construction debris",
];

/// Floor-like labels per semantic model bias
pub const OUTDOOR_FLOOR_LABELS: &[&str] = &["road", "sidewalk", "terrain"];
pub const INDOOR_FLOOR_LABELS: &[&str] = &["floor", "road", "sidewalk", "earth", "rug", "path"];

/// Background labels that are always safe to subtract from the pile
pub const SAFE_BG_LABELS: &[&str] = &["sky", "building", "fence", "person", "car"];

/// Background labels only subtractable outside yard-waste scenes
pub const RISKY_BG_LABELS: &[&str] = &["vegetation", "tree", "plant"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_registry_sizes() {
        assert_eq!(AnchorKind::from_label("garage door"), Some(AnchorKind::Door));
        assert_eq!(AnchorKind::Door.expected_size_m(), 2.03);
        assert_eq!(AnchorKind::from_label("spare tire"), Some(AnchorKind::Tire));
        assert_eq!(AnchorKind::from_label("garbage"), None);
    }

    #[test]
    fn trust_order_door_over_chair() {
        assert!(AnchorKind::Door.trust_rank() < AnchorKind::Chair.trust_rank());
        assert!(AnchorKind::Tire.trust_rank() < AnchorKind::Person.trust_rank());
    }

    #[test]
    fn catalog_prefers_specific_entries() {
        assert_eq!(catalog_volume_cy("queen mattress"), Some(1.2));
        assert_eq!(catalog_volume_cy("king mattress"), Some(1.5));
        assert_eq!(catalog_volume_cy("mattress"), Some(1.2));
        assert_eq!(catalog_volume_cy("dining table"), Some(1.0));
        assert_eq!(catalog_volume_cy("table"), Some(0.6));
        assert_eq!(catalog_volume_cy("sofa"), Some(2.0));
        assert_eq!(catalog_volume_cy("umbrella"), None);
    }

    #[test]
    fn surcharges_are_stamped() {
        let fridge = surcharges_for("refrigerator");
        assert!(fridge.contains(&Surcharge::TwoPersonLift));
        assert!(fridge.contains(&Surcharge::Hazmat));

        let tv = surcharges_for("tv");
        assert_eq!(tv, vec![Surcharge::EWaste]);
    }

    #[test]
    fn crop_factor_lookup() {
        assert_eq!(
            DeviceFamily::from_model("iPhone 13 Pro Max").map(|d| d.crop_factor()),
            Some(4.8)
        );
        assert_eq!(DeviceFamily::from_model("Pixel 8"), None);
    }
}
