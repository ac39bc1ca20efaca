//! Presentation mode decision — inline modal vs. full-page flow.
//!
//! The decision is a pure function of its inputs. Environment signals
//! (viewport width, motion preference) are read by the caller, usually
//! through an `EnvironmentProbe`.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Viewports narrower than this always get the full-page flow.
pub const MOBILE_BREAKPOINT_PX: u32 = 768;

/// How the booking flow is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationMode {
    Modal,
    Page,
}

impl std::fmt::Display for PresentationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Modal => write!(f, "modal"),
            Self::Page => write!(f, "page"),
        }
    }
}

/// Why a mode was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeReason {
    Forced,
    AccessibilityMode,
    ReducedMotion,
    SmallViewport,
    HubService,
    LeafInHierarchy,
    OutsideHierarchy,
}

impl ModeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forced => "forced",
            Self::AccessibilityMode => "accessibility_mode",
            Self::ReducedMotion => "reduced_motion",
            Self::SmallViewport => "small_viewport",
            Self::HubService => "hub_service",
            Self::LeafInHierarchy => "leaf_in_hierarchy",
            Self::OutsideHierarchy => "outside_hierarchy",
        }
    }
}

impl std::fmt::Display for ModeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Environment signals the host reads on the engine's behalf.
pub trait EnvironmentProbe: Send + Sync {
    fn viewport_width(&self) -> u32;
    fn prefers_reduced_motion(&self) -> bool;
    fn accessibility_mode(&self) -> bool {
        false
    }
}

/// A probe returning fixed values.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe {
    pub viewport_width: u32,
    pub prefers_reduced_motion: bool,
    pub accessibility_mode: bool,
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self {
            viewport_width: 1280,
            prefers_reduced_motion: false,
            accessibility_mode: false,
        }
    }
}

impl EnvironmentProbe for StaticProbe {
    fn viewport_width(&self) -> u32 {
        self.viewport_width
    }

    fn prefers_reduced_motion(&self) -> bool {
        self.prefers_reduced_motion
    }

    fn accessibility_mode(&self) -> bool {
        self.accessibility_mode
    }
}

/// Inputs to the decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeOptions {
    /// The trigger sits inside a structured service hierarchy.
    pub in_service_hierarchy: bool,
    /// The target is a leaf service rather than a hub with sub-choices.
    pub is_leaf_service: bool,
    pub prefers_reduced_motion: bool,
    pub accessibility_mode: bool,
    pub viewport_width: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_mode: Option<PresentationMode>,
}

impl ModeOptions {
    /// Fill the environment-derived fields from a probe.
    pub fn from_probe(
        probe: &dyn EnvironmentProbe,
        in_service_hierarchy: bool,
        is_leaf_service: bool,
    ) -> Self {
        Self {
            in_service_hierarchy,
            is_leaf_service,
            prefers_reduced_motion: probe.prefers_reduced_motion(),
            accessibility_mode: probe.accessibility_mode(),
            viewport_width: probe.viewport_width(),
            forced_mode: None,
        }
    }

    pub fn forced(mut self, mode: PresentationMode) -> Self {
        self.forced_mode = Some(mode);
        self
    }
}

/// The chosen mode and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeDecision {
    pub mode: PresentationMode,
    pub reason: ModeReason,
}

/// Chooses modal vs. page presentation.
#[derive(Debug, Clone, Copy)]
pub struct ModeDecisionEngine {
    breakpoint_px: u32,
}

impl Default for ModeDecisionEngine {
    fn default() -> Self {
        Self {
            breakpoint_px: MOBILE_BREAKPOINT_PX,
        }
    }
}

impl ModeDecisionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_breakpoint(breakpoint_px: u32) -> Self {
        Self { breakpoint_px }
    }

    pub fn decide(&self, options: &ModeOptions) -> ModeDecision {
        let (mode, reason) = if let Some(forced) = options.forced_mode {
            (forced, ModeReason::Forced)
        } else if options.accessibility_mode {
            (PresentationMode::Page, ModeReason::AccessibilityMode)
        } else if options.prefers_reduced_motion {
            (PresentationMode::Page, ModeReason::ReducedMotion)
        } else if options.viewport_width < self.breakpoint_px {
            (PresentationMode::Page, ModeReason::SmallViewport)
        } else if !options.is_leaf_service {
            (PresentationMode::Page, ModeReason::HubService)
        } else if options.in_service_hierarchy {
            (PresentationMode::Modal, ModeReason::LeafInHierarchy)
        } else {
            (PresentationMode::Page, ModeReason::OutsideHierarchy)
        };

        debug!(mode = %mode, reason = %reason, "Presentation mode decided");
        ModeDecision { mode, reason }
    }
}
