//! Maps channels to the consumers registered for them.

use std::fmt::Display;
use std::sync::Arc;

use hashbrown::HashSet;
use thiserror::Error;

use crate::consumer::Consumer;

/// Matches every channel when used as a pattern
pub const WILDCARD: &str = "*";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a consumer named {0:?} is already registered")]
    DuplicateName(String),

    #[error("no consumer named {0:?} is registered")]
    UnknownConsumer(String),

    #[error("consumer {0:?} has an empty channel pattern")]
    EmptyChannel(String),

    #[error("consumer name must not be empty")]
    EmptyName,
}

/// The channels a consumer wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPattern {
    Exact(Arc<str>),
    /// Several channels, matched like exact names
    OneOf(Vec<Arc<str>>),
    Wildcard,
}

impl ChannelPattern {
    /// Parse `*`, a channel name, or a comma separated list of channel names.
    ///
    /// Returns `None` if no channel name remains after trimming.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s == WILDCARD {
            return Some(Self::Wildcard);
        }
        let mut seen = HashSet::new();
        let mut channels: Vec<Arc<str>> = s
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty() && seen.insert(*c))
            .map(Arc::from)
            .collect();
        match channels.len() {
            0 => None,
            1 => channels.pop().map(Self::Exact),
            _ => Some(Self::OneOf(channels)),
        }
    }

    pub fn matches(&self, channel: &str) -> bool {
        match self {
            Self::Exact(c) => c.as_ref() == channel,
            Self::OneOf(cs) => cs.iter().any(|c| c.as_ref() == channel),
            Self::Wildcard => true,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard)
    }

    /// The named channels; empty for the wildcard
    pub fn channels(&self) -> &[Arc<str>] {
        match self {
            Self::Exact(c) => std::slice::from_ref(c),
            Self::OneOf(cs) => cs,
            Self::Wildcard => &[],
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Wildcard => false,
            _ => self.channels().iter().all(|c| c.is_empty()),
        }
    }
}

impl Display for ChannelPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(c) => f.write_str(c),
            Self::OneOf(cs) => f.write_str(&cs.join(",")),
            Self::Wildcard => f.write_str(WILDCARD),
        }
    }
}

impl From<&str> for ChannelPattern {
    fn from(s: &str) -> Self {
        Self::parse(s).unwrap_or_else(|| Self::Exact(Arc::from("")))
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerRegistration {
    name: Arc<str>,
    channel_pattern: ChannelPattern,
    handler: Arc<dyn Consumer>,
}

impl ConsumerRegistration {
    pub fn new(
        name: impl Into<Arc<str>>,
        channel_pattern: impl Into<ChannelPattern>,
        handler: Arc<dyn Consumer>,
    ) -> Self {
        Self {
            name: name.into(),
            channel_pattern: channel_pattern.into(),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel_pattern(&self) -> &ChannelPattern {
        &self.channel_pattern
    }

    pub fn handler(&self) -> &Arc<dyn Consumer> {
        &self.handler
    }
}

/// Consumer registrations in registration order.
///
/// Mutated only while setting up a listener; the listener and its dispatcher share it read-only
/// afterwards.
#[derive(Debug, Default, Clone)]
pub struct ConsumerRegistry {
    registrations: Vec<ConsumerRegistration>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: ConsumerRegistration) -> Result<(), RegistryError> {
        if registration.name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if registration.channel_pattern.is_empty() {
            return Err(RegistryError::EmptyChannel(registration.name.to_string()));
        }
        if self.get(&registration.name).is_some() {
            return Err(RegistryError::DuplicateName(registration.name.to_string()));
        }
        self.registrations.push(registration);
        Ok(())
    }

    /// Shorthand for registering `handler` under `name` for `channel_pattern`
    pub fn register_consumer(
        &mut self,
        name: &str,
        channel_pattern: &str,
        handler: Arc<dyn Consumer>,
    ) -> Result<(), RegistryError> {
        let pattern = ChannelPattern::parse(channel_pattern)
            .ok_or_else(|| RegistryError::EmptyChannel(name.to_string()))?;
        self.register(ConsumerRegistration::new(name, pattern, handler))
    }

    pub fn deregister(&mut self, name: &str) -> Result<ConsumerRegistration, RegistryError> {
        let pos = self
            .registrations
            .iter()
            .position(|r| r.name() == name)
            .ok_or_else(|| RegistryError::UnknownConsumer(name.to_string()))?;
        Ok(self.registrations.remove(pos))
    }

    pub fn get(&self, name: &str) -> Option<&ConsumerRegistration> {
        self.registrations.iter().find(|r| r.name() == name)
    }

    /// Consumers for `channel`: exact and list matches first, then wildcards, each group in
    /// registration order
    pub fn lookup(&self, channel: &str) -> Vec<&ConsumerRegistration> {
        let named = self
            .registrations
            .iter()
            .filter(|r| !r.channel_pattern.is_wildcard() && r.channel_pattern.matches(channel));
        let wildcards = self
            .registrations
            .iter()
            .filter(|r| r.channel_pattern.is_wildcard());
        named.chain(wildcards).collect()
    }

    /// Every distinct channel named by a registration, in first registration order
    pub fn channels(&self) -> Vec<Arc<str>> {
        let mut seen = HashSet::new();
        self.registrations
            .iter()
            .flat_map(|r| r.channel_pattern.channels())
            .filter(|c| seen.insert(Arc::clone(c)))
            .map(Arc::clone)
            .collect()
    }

    pub fn has_wildcard(&self) -> bool {
        self.registrations
            .iter()
            .any(|r| r.channel_pattern.is_wildcard())
    }

    /// Keep only the registrations named in `names`. An empty selection keeps everything.
    pub fn select<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), RegistryError> {
        if names.is_empty() {
            return Ok(());
        }
        let selected: Vec<&str> = names.iter().map(|n| n.as_ref()).collect();
        if let Some(unknown) = selected.iter().find(|n| self.get(n).is_none()) {
            return Err(RegistryError::UnknownConsumer(unknown.to_string()));
        }
        let selected: HashSet<&str> = selected.into_iter().collect();
        self.registrations
            .retain(|r| selected.contains(r.name.as_ref()));
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registrations.iter().map(|r| r.name())
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::LoggingConsumer;
    use pretty_assertions::assert_eq;

    fn logging() -> Arc<dyn Consumer> {
        Arc::new(LoggingConsumer)
    }

    fn registry() -> ConsumerRegistry {
        let mut registry = ConsumerRegistry::new();
        registry.register_consumer("audit", "*", logging()).unwrap();
        registry.register_consumer("orders", "orders", logging()).unwrap();
        registry
            .register_consumer("cache", "users, orders", logging())
            .unwrap();
        registry.register_consumer("metrics", "*", logging()).unwrap();
        registry
    }

    fn names<'a>(regs: &[&'a ConsumerRegistration]) -> Vec<&'a str> {
        regs.iter().map(|r| r.name()).collect()
    }

    #[test]
    fn lookup_puts_wildcards_last_in_registration_order() {
        let registry = registry();
        assert_eq!(
            names(&registry.lookup("orders")),
            vec!["orders", "cache", "audit", "metrics"]
        );
        assert_eq!(
            names(&registry.lookup("users")),
            vec!["cache", "audit", "metrics"]
        );
        assert_eq!(names(&registry.lookup("other")), vec!["audit", "metrics"]);
    }

    #[test]
    fn channels_are_distinct_and_ordered() {
        let channels: Vec<String> = registry()
            .channels()
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(channels, vec!["orders", "users"]);
    }

    #[test]
    fn registration_errors() {
        let mut registry = registry();
        assert!(matches!(
            registry.register_consumer("orders", "x", logging()),
            Err(RegistryError::DuplicateName(n)) if n == "orders"
        ));
        assert!(matches!(
            registry.register_consumer("blank", " , ", logging()),
            Err(RegistryError::EmptyChannel(_))
        ));
        assert!(matches!(
            registry.register(ConsumerRegistration::new("", "x", logging())),
            Err(RegistryError::EmptyName)
        ));
        assert!(matches!(
            registry.register(ConsumerRegistration::new("blank", "", logging())),
            Err(RegistryError::EmptyChannel(_))
        ));
        assert!(matches!(
            registry.deregister("nope"),
            Err(RegistryError::UnknownConsumer(_))
        ));
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn deregister_and_select() {
        let mut registry = registry();
        registry.deregister("audit").unwrap();
        assert_eq!(names(&registry.lookup("other")), vec!["metrics"]);

        assert!(matches!(
            registry.select(&["cache", "missing"]),
            Err(RegistryError::UnknownConsumer(n)) if n == "missing"
        ));
        registry.select::<&str>(&[]).unwrap();
        assert_eq!(registry.len(), 3);

        registry.select(&["metrics", "cache"]).unwrap();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["cache", "metrics"]
        );
        assert!(registry.has_wildcard());
    }

    #[test]
    fn pattern_parsing() {
        assert_eq!(ChannelPattern::parse(" * "), Some(ChannelPattern::Wildcard));
        assert_eq!(
            ChannelPattern::parse("orders"),
            Some(ChannelPattern::Exact(Arc::from("orders")))
        );
        assert_eq!(
            ChannelPattern::parse("a,b,a"),
            Some(ChannelPattern::OneOf(vec![Arc::from("a"), Arc::from("b")]))
        );
        assert_eq!(ChannelPattern::parse(""), None);
        assert_eq!(ChannelPattern::from("a, b").to_string(), "a,b");
    }
}
