use serde::Serialize;

struct Advisory {
	label: &'static str,
	name: &'static str,
	cause: &'static str,
	treatment: &'static [&'static str],
	prevention: &'static [&'static str],
}

static KNOWLEDGE_BASE: [Advisory; 6] = [
	Advisory {
		label: "bacterial_blight",
		name: "Bacterial Leaf Blight",
		cause: "Caused by Xanthomonas oryzae pv. oryzae bacteria, leading to wilting and drying of leaves.",
		treatment: &[
			"Use resistant rice varieties (e.g., IR20, IR64).",
			"Avoid excessive nitrogen fertilizer.",
			"Spray copper-based fungicides or bactericides like Streptocycline (0.01%).",
		],
		prevention: &[
			"Ensure proper field drainage.",
			"Remove infected plants early.",
			"Rotate crops to prevent bacterial buildup.",
		],
	},
	Advisory {
		label: "brown_spot",
		name: "Brown Spot Disease",
		cause: "Caused by the fungus Bipolaris oryzae, forming brown lesions on leaves and panicles.",
		treatment: &[
			"Apply fungicides such as Mancozeb (2.5g/L) or Carbendazim (1g/L).",
			"Improve soil fertility with balanced nutrients (especially nitrogen).",
		],
		prevention: &[
			"Use disease-free seeds.",
			"Avoid dense planting and waterlogging.",
			"Maintain field sanitation and remove debris.",
		],
	},
	Advisory {
		label: "rice_blast",
		name: "Rice Blast Disease",
		cause: "Caused by Magnaporthe oryzae fungus, leading to spindle-shaped lesions and poor yield.",
		treatment: &[
			"Spray Tricyclazole (0.6g/L) or Isoprothiolane (1.5mL/L).",
			"Apply potassium and silicon fertilizers for resistance.",
		],
		prevention: &[
			"Use resistant varieties (e.g., HR12, Co 39).",
			"Avoid excessive nitrogen during early growth.",
			"Maintain good air circulation in the field.",
		],
	},
	Advisory {
		label: "sheath_blight",
		name: "Sheath Blight",
		cause: "Caused by Rhizoctonia solani fungus, forming irregular lesions near waterline.",
		treatment: &[
			"Spray Hexaconazole (1mL/L) or Validamycin (2mL/L).",
			"Improve field drainage and reduce humidity.",
		],
		prevention: &[
			"Use moderate plant spacing.",
			"Avoid continuous rice cropping.",
			"Burn or remove infected residues.",
		],
	},
	Advisory {
		label: "leaf_smut",
		name: "Leaf Smut",
		cause: "Caused by Entyloma oryzae fungus, producing black spots and streaks on leaves.",
		treatment: &[
			"Spray Propiconazole (1mL/L) or Mancozeb (2.5g/L).",
			"Apply balanced NPK fertilizers.",
		],
		prevention: &[
			"Use resistant rice varieties.",
			"Maintain proper spacing and weed control.",
		],
	},
	Advisory {
		label: "healthy",
		name: "Healthy Leaf",
		cause: "No signs of infection detected.",
		treatment: &["Maintain regular irrigation and nutrient balance."],
		prevention: &[
			"Continue good agricultural practices.",
			"Monitor regularly for early disease symptoms.",
		],
	},
];

/// Display text for one disease label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvisoryEntry {
	pub name: String,
	pub cause: String,
	pub treatment: Vec<String>,
	pub prevention: Vec<String>,
}

impl From<&Advisory> for AdvisoryEntry {
	fn from(advisory: &Advisory) -> Self {
		Self {
			name: advisory.name.to_string(),
			cause: advisory.cause.to_string(),
			treatment: advisory.treatment.iter().map(|s| s.to_string()).collect(),
			prevention: advisory.prevention.iter().map(|s| s.to_string()).collect(),
		}
	}
}

impl AdvisoryEntry {
	fn placeholder(label: &str) -> Self {
		Self {
			name: title_case(label),
			cause: "No details available.".to_string(),
			treatment: Vec::new(),
			prevention: Vec::new(),
		}
	}
}

/// Never fails: labels missing from the knowledge base get a placeholder.
pub fn lookup(label: &str) -> AdvisoryEntry {
	KNOWLEDGE_BASE
		.iter()
		.find(|advisory| advisory.label == label)
		.map(AdvisoryEntry::from)
		.unwrap_or_else(|| AdvisoryEntry::placeholder(label))
}

pub fn known_labels() -> impl Iterator<Item = &'static str> {
	KNOWLEDGE_BASE.iter().map(|advisory| advisory.label)
}

/// Upper-cases every letter that follows a non-letter and lower-cases the
/// rest, so `leaf_scald` becomes `Leaf_Scald`.
pub fn title_case(label: &str) -> String {
	let mut previous_is_letter = false;

	label
		.chars()
		.flat_map(|c| {
			let mapped: Vec<char> = if !c.is_alphabetic() {
				vec![c]
			} else if previous_is_letter {
				c.to_lowercase().collect()
			} else {
				c.to_uppercase().collect()
			};
			previous_is_letter = c.is_alphabetic();
			mapped
		})
		.collect()
}
