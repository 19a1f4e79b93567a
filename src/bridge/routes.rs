//! Which LINE conversation is paired with which Discord channel.

use std::collections::HashMap;

use crate::config::Route;

/// Bidirectional pairing lookup.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    line_to_discord: HashMap<String, String>,
    discord_to_line: HashMap<String, String>,
}

impl RouteTable {
    /// Build from configured routes. A later duplicate replaces an earlier one.
    pub fn new(routes: &[Route]) -> Self {
        let mut table = Self::default();
        for route in routes {
            table.insert(&route.line_id, &route.discord_channel_id);
        }
        table
    }

    pub fn insert(&mut self, line_id: &str, discord_channel_id: &str) {
        if let Some(old) = self
            .line_to_discord
            .insert(line_id.to_string(), discord_channel_id.to_string())
        {
            self.discord_to_line.remove(&old);
        }
        if let Some(old) = self
            .discord_to_line
            .insert(discord_channel_id.to_string(), line_id.to_string())
        {
            if old != line_id {
                self.line_to_discord.remove(&old);
            }
        }
    }

    /// Discord channel a LINE source is bridged to.
    pub fn discord_for(&self, line_id: &str) -> Option<&str> {
        self.line_to_discord.get(line_id).map(String::as_str)
    }

    /// LINE destination a Discord channel is bridged to.
    pub fn line_for(&self, discord_channel_id: &str) -> Option<&str> {
        self.discord_to_line.get(discord_channel_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.line_to_discord.len()
    }

    pub fn is_empty(&self) -> bool {
        self.line_to_discord.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(line_id: &str, discord_channel_id: &str) -> Route {
        Route {
            line_id: line_id.into(),
            discord_channel_id: discord_channel_id.into(),
        }
    }

    #[test]
    fn resolves_both_ways() {
        let table = RouteTable::new(&[route("Cgroup", "111"), route("Uuser", "222")]);
        assert_eq!(table.discord_for("Cgroup"), Some("111"));
        assert_eq!(table.line_for("222"), Some("Uuser"));
        assert_eq!(table.discord_for("Cother"), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn duplicate_replaces_stale_pairing() {
        let table = RouteTable::new(&[route("Cgroup", "111"), route("Cgroup", "333")]);
        assert_eq!(table.discord_for("Cgroup"), Some("333"));
        assert_eq!(table.line_for("333"), Some("Cgroup"));
        assert_eq!(table.line_for("111"), None);

        let table = RouteTable::new(&[route("Ca", "111"), route("Cb", "111")]);
        assert_eq!(table.line_for("111"), Some("Cb"));
        assert_eq!(table.discord_for("Ca"), None);
    }
}
