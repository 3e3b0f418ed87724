//! System prompt assembly.
//!
//! Blocks are tiered for prompt caching: identity and tool inventory rarely
//! change (stable), deployment facts change occasionally (semi-stable), and
//! the date/tier/session line changes every turn (dynamic).

use chrono::Local;

use herald_core::config::HeraldConfig;
use herald_core::types::{SystemBlock, Tier};
use herald_sessions::Session;
use herald_tools::registry::ToolRegistry;

pub fn build_context(
    config: &HeraldConfig,
    registry: &ToolRegistry,
    tier: &str,
    session: &Session,
    recall: &str,
) -> Vec<SystemBlock> {
    let mut blocks = Vec::new();

    let identity = if config.agent.context_stable.is_empty() {
        format!(
            "You are {}, a conversational agent daemon. You receive messages \
             from chat transports, HTTP clients, and automated notifications, \
             and you can act on the host through your tools.",
            config.agent.name
        )
    } else {
        config.agent.context_stable.join("\n\n")
    };
    blocks.push(SystemBlock::new(identity, Tier::Stable));

    let mut tool_lines = vec!["## Tools".to_string()];
    for (name, description) in registry.brief_descriptions() {
        tool_lines.push(format!("- **{name}**: {description}"));
    }
    blocks.push(SystemBlock::new(tool_lines.join("\n"), Tier::Stable));

    let mut deployment = config.agent.context_semi_stable.clone();
    if !config.channel.contacts.is_empty() {
        deployment.push(format!("Known contacts: {}", config.channel.contacts.join(", ")));
    }
    if !deployment.is_empty() {
        blocks.push(SystemBlock::new(deployment.join("\n\n"), Tier::SemiStable));
    }

    // Fresh sessions carry an excerpt of the contact's previous archived
    // conversation so the thread doesn't restart cold.
    if !recall.is_empty() {
        blocks.push(SystemBlock::new(recall, Tier::SemiStable));
    }

    blocks.push(SystemBlock::new(
        format!(
            "Current date/time: {}\nContext tier: {}\nSession: {} messages, {} compactions.",
            Local::now().format("%a, %d. %b %Y - %H:%M"),
            tier,
            session.messages.len(),
            session.compaction_count,
        ),
        Tier::Dynamic,
    ));

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::config::{AgentConfig, ChannelConfig};

    #[test]
    fn blocks_are_tiered_stable_to_dynamic() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new("s1", dir.path(), "primary", "alice").unwrap();
        let registry = ToolRegistry::new(30_000);
        let config = HeraldConfig {
            agent: AgentConfig {
                name: "Herald".into(),
                ..AgentConfig::default()
            },
            channel: ChannelConfig {
                r#type: "none".into(),
                contacts: vec!["alice".into()],
            },
            ..HeraldConfig::default()
        };

        let blocks = build_context(&config, &registry, "full", &session, "");
        assert!(matches!(blocks[0].tier, Tier::Stable));
        assert!(blocks[0].text.contains("Herald"));
        assert!(blocks.iter().any(|b| matches!(b.tier, Tier::SemiStable) && b.text.contains("alice")));
        let last = blocks.last().unwrap();
        assert!(matches!(last.tier, Tier::Dynamic));
        assert!(last.text.contains("Context tier: full"));

        let with_recall = build_context(
            &config,
            &registry,
            "full",
            &session,
            "Session recall (last conversation):\n\n**alice:** hi",
        );
        assert_eq!(with_recall.len(), blocks.len() + 1);
        assert!(with_recall
            .iter()
            .any(|b| matches!(b.tier, Tier::SemiStable) && b.text.starts_with("Session recall")));
    }
}
