//! Profile matching: which mode should be active for the focused process.

use crate::config::ResolutionProfile;
use crate::domain::ResolutionMode;

/// Outcome of matching a focused process against the profile list.
///
/// The variant records where the mode came from: only a `Profile` match is an
/// automation request. `Default` and `Baseline` are the revert targets, the
/// latter being the "no change intended" signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedTarget {
    /// The first profile whose process name equals the focused name.
    Profile(ResolutionMode),
    /// No profile matched; the configured default mode.
    Default(ResolutionMode),
    /// No profile matched and no default is set; the baseline mode.
    Baseline(ResolutionMode),
    /// No profile matched, no default is set and no baseline is known.
    Unchanged,
}

impl ResolvedTarget {
    /// The mode this target asks for, if any.
    pub fn mode(self) -> Option<ResolutionMode> {
        match self {
            Self::Profile(m) | Self::Default(m) | Self::Baseline(m) => Some(m),
            Self::Unchanged => None,
        }
    }
}

/// Resolve the target mode for `process`.
///
/// Scans `profiles` in order and returns the first exact, case-sensitive name
/// match. Later entries with the same name are never consulted. `None` for
/// the process (unknown focus) never matches a profile.
pub fn resolve_target(
    process: Option<&str>,
    profiles: &[ResolutionProfile],
    default_profile: Option<ResolutionMode>,
    baseline: Option<ResolutionMode>,
) -> ResolvedTarget {
    if let Some(name) = process
        && let Some(profile) = profiles.iter().find(|p| p.process_name == name)
    {
        return ResolvedTarget::Profile(profile.mode());
    }

    match (default_profile, baseline) {
        (Some(mode), _) => ResolvedTarget::Default(mode),
        (None, Some(mode)) => ResolvedTarget::Baseline(mode),
        (None, None) => ResolvedTarget::Unchanged,
    }
}
