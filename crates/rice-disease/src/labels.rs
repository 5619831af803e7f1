use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::error::RiceError;

/// Dense `index <-> class name` mapping built from a dataset's class
/// directories. Indices are always `0..len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelIndex {
	classes: Vec<String>,
}

impl LabelIndex {
	/// Assigns the next free index to each distinct name, in the order given.
	pub fn build<I, S>(class_names: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let mut classes: Vec<String> = Vec::new();
		for name in class_names {
			let name = name.into();
			if !classes.contains(&name) {
				classes.push(name);
			}
		}

		Self { classes }
	}

	/// Builds the index from the subdirectories of `dir`, sorted by name so the
	/// numbering does not depend on directory listing order.
	pub fn scan<P: AsRef<Path>>(dir: P) -> Result<Self, RiceError> {
		let mut names = Vec::new();
		for entry in fs::read_dir(dir)? {
			let path = entry?.path();
			if !path.is_dir() {
				continue;
			}
			if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
				names.push(name.to_string());
			}
		}
		names.sort();

		Ok(Self::build(names))
	}

	pub fn len(&self) -> usize {
		self.classes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.classes.is_empty()
	}

	pub fn label(&self, index: usize) -> Option<&str> {
		self.classes.get(index).map(String::as_str)
	}

	pub fn index_of(&self, label: &str) -> Option<usize> {
		self.classes.iter().position(|c| c == label)
	}

	pub fn classes(&self) -> &[String] {
		&self.classes
	}

	/// `{className: index}` as stored on disk.
	pub fn to_map(&self) -> BTreeMap<String, usize> {
		self.classes
			.iter()
			.enumerate()
			.map(|(i, c)| (c.clone(), i))
			.collect()
	}

	pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), RiceError> {
		let path = path.as_ref();
		let json = serde_json::to_string_pretty(&self.to_map())
			.map_err(|err| RiceError::index_file(path, err))?;
		fs::write(path, json)?;

		Ok(())
	}

	/// Reads `{className: index}` and inverts it. Inference cannot proceed
	/// without a complete, gap-free mapping.
	pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RiceError> {
		let path = path.as_ref();
		let raw = fs::read_to_string(path).map_err(|err| RiceError::index_file(path, err))?;
		let map: HashMap<String, usize> =
			serde_json::from_str(&raw).map_err(|err| RiceError::index_file(path, err))?;

		Self::from_map(map).map_err(|reason| RiceError::index_file(path, reason))
	}

	fn from_map(map: HashMap<String, usize>) -> Result<Self, String> {
		let mut slots: Vec<Option<String>> = vec![None; map.len()];
		for (name, index) in map {
			let Some(slot) = slots.get_mut(index) else {
				return Err(format!("index {index} of {name} is out of range"));
			};
			if let Some(other) = slot.as_ref() {
				return Err(format!("index {index} used by both {other} and {name}"));
			}
			*slot = Some(name);
		}

		// Every slot is filled: n distinct indices below n
		let classes = slots.into_iter().flatten().collect();
		Ok(Self { classes })
	}
}
