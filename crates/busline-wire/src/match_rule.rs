//! Signal match rules
//!
//! Rules have the textual form
//!
//! ```text
//! type='signal',sender='S',path='P',interface='I',member='M',arg0='A0',...
//! ```
//!
//! Each field is emitted only when non-empty; `argN` entries are emitted
//! only for positions that carry a value, keeping their index.

use std::fmt;

use crate::error::{Result, WireError};
use crate::message::{Message, MessageType};

/// A parsed or built signal match rule
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    /// Positional string argument matches; `None` skips the position
    pub args: Vec<Option<String>>,
}

impl MatchRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = member.into();
        self
    }

    pub fn args(mut self, args: Vec<Option<String>>) -> Self {
        self.args = args;
        self
    }

    /// Parse the textual form
    pub fn parse(rule: &str) -> Result<Self> {
        let mut parsed = MatchRule::new();
        for (key, value) in split_fields(rule)? {
            match key.as_str() {
                "type" => {
                    if value != "signal" {
                        return Err(WireError::InvalidMatchRule(rule.to_string()));
                    }
                }
                "sender" => parsed.sender = value,
                "path" => parsed.path = value,
                "interface" => parsed.interface = value,
                "member" => parsed.member = value,
                other => {
                    let index: usize = other
                        .strip_prefix("arg")
                        .and_then(|n| n.parse().ok())
                        .filter(|n| *n < 64)
                        .ok_or_else(|| WireError::InvalidMatchRule(rule.to_string()))?;
                    if parsed.args.len() <= index {
                        parsed.args.resize(index + 1, None);
                    }
                    parsed.args[index] = Some(value);
                }
            }
        }
        Ok(parsed)
    }

    /// Check a signal against this rule
    ///
    /// `owner_of` resolves a well-known sender name to its current unique
    /// owner, so rules naming a well-known service match messages sent by
    /// the owning connection.
    pub fn matches<F>(&self, msg: &Message, owner_of: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        if msg.kind() != MessageType::Signal {
            return false;
        }
        if !self.sender.is_empty()
            && self.sender != msg.sender()
            && owner_of(&self.sender).as_deref() != Some(msg.sender())
        {
            return false;
        }
        if !self.path.is_empty() && self.path != msg.path() {
            return false;
        }
        if !self.interface.is_empty() && self.interface != msg.interface() {
            return false;
        }
        if !self.member.is_empty() && self.member != msg.member() {
            return false;
        }
        self.args.iter().enumerate().all(|(i, expected)| match expected {
            None => true,
            Some(expected) => msg
                .args()
                .get(i)
                .and_then(|v| v.as_str())
                .map_or(false, |actual| actual == expected),
        })
    }
}

fn split_fields(rule: &str) -> Result<Vec<(String, String)>> {
    let invalid = || WireError::InvalidMatchRule(rule.to_string());
    let mut fields = Vec::new();
    let mut rest = rule.trim();
    while !rest.is_empty() {
        let eq = rest.find('=').ok_or_else(invalid)?;
        let key = rest[..eq].trim().to_string();
        let after = rest[eq + 1..].strip_prefix('\'').ok_or_else(invalid)?;
        let close = after.find('\'').ok_or_else(invalid)?;
        fields.push((key, after[..close].to_string()));
        rest = after[close + 1..].trim_start();
        if let Some(next) = rest.strip_prefix(',') {
            rest = next.trim_start();
        } else if !rest.is_empty() {
            return Err(invalid());
        }
    }
    Ok(fields)
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = vec!["type='signal'".to_string()];
        if !self.sender.is_empty() {
            fields.push(format!("sender='{}'", self.sender));
        }
        if !self.path.is_empty() {
            fields.push(format!("path='{}'", self.path));
        }
        if !self.interface.is_empty() {
            fields.push(format!("interface='{}'", self.interface));
        }
        if !self.member.is_empty() {
            fields.push(format!("member='{}'", self.member));
        }
        for (i, arg) in self.args.iter().enumerate() {
            if let Some(arg) = arg {
                fields.push(format!("arg{}='{}'", i, arg));
            }
        }
        write!(f, "{}", fields.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_text() {
        let rule = MatchRule::new()
            .sender("org.freedesktop.DBus")
            .interface("org.freedesktop.DBus")
            .member("NameOwnerChanged")
            .args(vec![Some("org.freedesktop.DBus".into())]);
        assert_eq!(
            rule.to_string(),
            "type='signal',sender='org.freedesktop.DBus',interface='org.freedesktop.DBus',\
             member='NameOwnerChanged',arg0='org.freedesktop.DBus'"
        );
    }

    #[test]
    fn test_rule_skips_null_args() {
        let rule = MatchRule::new()
            .member("Changed")
            .args(vec![None, Some(String::new()), Some("x".into())]);
        assert_eq!(rule.to_string(), "type='signal',member='Changed',arg1='',arg2='x'");
        assert_eq!(MatchRule::new().to_string(), "type='signal'");
    }

    #[test]
    fn test_parse() {
        let text = "type='signal',path='/a',member='Changed',arg2='x'";
        let rule = MatchRule::parse(text).unwrap();
        assert_eq!(rule.path, "/a");
        assert_eq!(rule.args, vec![None, None, Some("x".to_string())]);
        assert_eq!(rule.to_string(), text);

        assert!(MatchRule::parse("type='method_call'").is_err());
        assert!(MatchRule::parse("member=Changed").is_err());
        assert!(MatchRule::parse("bogus='1'").is_err());
    }

    #[test]
    fn test_matches() {
        let rule = MatchRule::new()
            .sender("org.example")
            .member("Changed")
            .args(vec![Some("a".into())]);

        let mut msg = Message::signal("/p", "org.example.I", "Changed").with_arg("a");
        msg.set_sender(":1.5");
        assert!(rule.matches(&msg, |name| (name == "org.example").then(|| ":1.5".to_string())));
        assert!(!rule.matches(&msg, |_| None));

        let other = Message::signal("/p", "org.example.I", "Changed").with_arg("b");
        assert!(!MatchRule::new().args(vec![Some("a".into())]).matches(&other, |_| None));
    }
}
