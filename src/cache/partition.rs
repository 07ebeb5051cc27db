//! Partition identity: purpose plus version generation.

use std::fmt;

/// What a cache partition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
  /// App shell: documents, bundles, other static assets
  StaticShell,
  /// Responses from the remote API
  ApiData,
  /// Images
  ImageAsset,
}

impl Purpose {
  pub const ALL: [Purpose; 3] = [Purpose::StaticShell, Purpose::ApiData, Purpose::ImageAsset];

  /// Prefix used in partition names. Never contains '-'.
  pub fn slug(&self) -> &'static str {
    match self {
      Purpose::StaticShell => "static",
      Purpose::ApiData => "data",
      Purpose::ImageAsset => "images",
    }
  }

  pub fn from_slug(slug: &str) -> Option<Self> {
    Purpose::ALL.into_iter().find(|p| p.slug() == slug)
  }
}

/// Name of one partition generation, rendered `<purpose>-<version>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionName {
  pub purpose: Purpose,
  pub version: String,
}

impl PartitionName {
  pub fn new(purpose: Purpose, version: impl Into<String>) -> Self {
    Self {
      purpose,
      version: version.into(),
    }
  }

  /// Parse a stored name. Names without a known purpose prefix yield None.
  pub fn parse(name: &str) -> Option<Self> {
    let (slug, version) = name.split_once('-')?;
    if version.is_empty() {
      return None;
    }
    Purpose::from_slug(slug).map(|purpose| Self::new(purpose, version))
  }

  /// One partition per purpose for `version`.
  pub fn all_for(version: &str) -> Vec<Self> {
    Purpose::ALL
      .into_iter()
      .map(|p| Self::new(p, version))
      .collect()
  }
}

impl fmt::Display for PartitionName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.purpose.slug(), self.version)
  }
}
