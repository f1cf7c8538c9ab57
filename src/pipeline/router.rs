//! Escalation router: a pure function from classification to decision.
//!
//! No I/O, no globals. The same classification and config always give the
//! same decision.

use crate::config::RouterConfig;
use crate::pipeline::types::{Classification, RoutingDecision, Trigger};

/// Decide whether to auto-send or escalate.
///
/// Triggers are checked in `config.precedence` order and the first one that
/// fires wins. Triggers absent from the precedence list never fire.
pub fn route(classification: &Classification, config: &RouterConfig) -> RoutingDecision {
    if !config.enabled {
        return RoutingDecision::AutoSend;
    }

    config
        .precedence
        .iter()
        .copied()
        .find(|trigger| fires(*trigger, classification, config))
        .map_or(RoutingDecision::AutoSend, |reason| RoutingDecision::Escalate { reason })
}

fn fires(trigger: Trigger, classification: &Classification, config: &RouterConfig) -> bool {
    match trigger {
        Trigger::Urgency => classification.urgency().is_pressing(),
        Trigger::Complexity => classification.complexity_score() >= config.complexity_threshold,
        // Both sides are lowercased at construction.
        Trigger::SensitiveTopic => classification
            .sensitive_topics()
            .iter()
            .any(|topic| config.sensitive_topics.contains(topic)),
    }
}
