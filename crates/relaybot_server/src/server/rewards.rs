#![forbid(unsafe_code)]

//! Reward redemption gate.
//!
//! Reward events are not conversational messages: they always skip command
//! matching, and optionally produce a configured acknowledgement line.

use relaybot_platform::RewardEvent;

#[derive(Debug, Clone, Default)]
pub struct RewardsGate {
	/// Acknowledgement template; `{user}` expands to the redeemer's name.
	ack_template: Option<String>,
}

impl RewardsGate {
	pub fn new(ack_template: Option<String>) -> Self {
		Self {
			ack_template: ack_template.filter(|t| !t.trim().is_empty()),
		}
	}

	/// Acknowledgement text for a redemption, if configured.
	pub fn acknowledgement(&self, reward: &RewardEvent) -> Option<String> {
		let template = self.ack_template.as_deref()?;
		let user = if reward.display_name.trim().is_empty() {
			"someone"
		} else {
			reward.display_name.as_str()
		};
		Some(template.replace("{user}", user))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn reward(display_name: &str) -> RewardEvent {
		RewardEvent {
			user_id: "u1".to_string(),
			display_name: display_name.to_string(),
			kind: 5005,
			detail: "cast a spell".to_string(),
		}
	}

	#[test]
	fn acknowledgement_expands_user() {
		let gate = RewardsGate::new(Some("Thanks {user}!".to_string()));
		assert_eq!(gate.acknowledgement(&reward("Bob")).as_deref(), Some("Thanks Bob!"));
		assert_eq!(gate.acknowledgement(&reward("  ")).as_deref(), Some("Thanks someone!"));
	}

	#[test]
	fn no_template_means_no_acknowledgement() {
		assert!(RewardsGate::new(None).acknowledgement(&reward("Bob")).is_none());
		assert!(RewardsGate::new(Some("  ".to_string())).acknowledgement(&reward("Bob")).is_none());
	}
}
