use std::collections::HashMap;

use thiserror::Error;

use crate::keymodel::EntryKey;

/// The master error type for the crate.
#[derive(Debug, Error)]
pub enum SectorKvError {
	#[error("{0}")]
	Custom(String),
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("unsupported data for key {key:?}: {reason} (size={size})")]
	UnsupportedData {
		key: EntryKey,
		reason: &'static str,
		size: u64,
	},
	#[error("{} key(s) could not be written", .0.len())]
	MultiUnsupportedData(HashMap<EntryKey, Box<SectorKvError>>),
	#[error("corrupted data for key {key:?}: expected {expected}, found {found}")]
	CorruptedData {
		key: EntryKey,
		expected: String,
		found: String,
	},
	#[error("invalid key: {0}")]
	InvalidKey(String),
	#[error("invalid region name: {0}")]
	InvalidRegionName(String),
	#[error("operation attempted on a closed handle")]
	AlreadyClosed,
	#[error("{description}")]
	Storage {
		description: String,
		causes: Vec<SectorKvError>,
	},
	#[error("region allocator could not satisfy request for {0} sector(s)")]
	AllocationFailure(u32),
	#[error("invalid argument: {0}")]
	InvalidArgument(String),
}

impl SectorKvError {
	pub fn custom<T, S: AsRef<str>>(msg: S) -> Result<T, Self> {
		Err(SectorKvError::Custom(msg.as_ref().to_owned()))
	}

	pub fn range_check<T, R>(value: T, range: R) -> Result<(), Self>
	where
		T: PartialOrd + Sized + std::fmt::Debug,
		R: std::ops::RangeBounds<T>,
	{
		if range.contains(&value) {
			Ok(())
		} else {
			Err(SectorKvError::Custom(format!("value {value:?} out of range")))
		}
	}

	pub fn storage(description: impl Into<String>, causes: Vec<SectorKvError>) -> Self {
		SectorKvError::Storage {
			description: description.into(),
			causes,
		}
	}

	/// Renders the full cause chain, one line per cause, correctly numbered
	/// (`Cause i/n`). The engine this crate descends from is known to print
	/// a fixed "Cause 1/N" regardless of index; that bug is not reproduced.
	pub fn describe_causes(&self) -> String {
		match self {
			SectorKvError::Storage { description, causes } => {
				let mut out = format!("{description}\n");
				let n = causes.len();
				for (i, cause) in causes.iter().enumerate() {
					out.push_str(&format!("  Cause {}/{}: {}\n", i + 1, n, cause));
				}
				out
			}
			other => other.to_string(),
		}
	}
}

pub type SectorKvResult<T> = Result<T, SectorKvError>;
