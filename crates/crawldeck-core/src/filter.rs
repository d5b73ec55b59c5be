//! Selection filter: strips draft/placeholder profiles from the remote list and picks
//! the default candidate when nothing else is selected.

use crate::profile::Profile;

/// Placeholder label of drafts created without a name.
pub const DEFAULT_PLACEHOLDER_LABEL: &str = "nuevo perfil";

/// Marker preferred by the default-selection heuristic.
pub const DEFAULT_PREFERRED_MARKER: &str = "demo";

/// Why [`SelectionFilter::choose_default`] picked its candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultReason {
    /// Name contains the preferred marker.
    PreferredMarker,
    /// No marker match; first entry in list order.
    FirstInOrder,
}

#[derive(Debug, Clone)]
pub struct SelectionFilter {
    placeholder: String,
    preferred_marker: String,
}

impl Default for SelectionFilter {
    fn default() -> Self {
        Self::new(DEFAULT_PLACEHOLDER_LABEL, DEFAULT_PREFERRED_MARKER)
    }
}

impl SelectionFilter {
    /// Both labels are compared lowercased and trimmed. An empty placeholder disables filtering.
    pub fn new(placeholder: &str, preferred_marker: &str) -> Self {
        Self {
            placeholder: placeholder.trim().to_lowercase(),
            preferred_marker: preferred_marker.trim().to_lowercase(),
        }
    }

    /// True when the profile is a draft and must never be chosen automatically.
    ///
    /// "Contains" already covers "equals" and "starts with".
    pub fn is_placeholder(&self, profile: &Profile) -> bool {
        !self.placeholder.is_empty() && profile.normalized_name().contains(&self.placeholder)
    }

    /// Selectable Set: order preserving and idempotent.
    pub fn apply(&self, raw: &[Profile]) -> Vec<Profile> {
        raw.iter()
            .filter(|p| {
                let drop = self.is_placeholder(p);
                if drop {
                    tracing::debug!(profile_id = p.id, name = %p.name, "placeholder profile filtered");
                }
                !drop
            })
            .cloned()
            .collect()
    }

    /// Default-selection heuristic over an already filtered set.
    pub fn choose_default<'a>(&self, selectable: &'a [Profile]) -> Option<(&'a Profile, DefaultReason)> {
        if !self.preferred_marker.is_empty() {
            if let Some(p) = selectable
                .iter()
                .find(|p| p.name.to_lowercase().contains(&self.preferred_marker))
            {
                return Some((p, DefaultReason::PreferredMarker));
            }
        }
        selectable.first().map(|p| (p, DefaultReason::FirstInOrder))
    }
}
