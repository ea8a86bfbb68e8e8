//! Resource rules file parsing.
//!
//! The rules file is an XML document listing the intranet URLs this agent is
//! authorized to expose. The registration path only needs `(url, agent-id,
//! allowed-users)` tuples and the `(host, port)` endpoint of each URL; the
//! full field-level schema belongs to the server side.

use thiserror::Error;
use url::Url;

/// One parsed rule from the rules file. Immutable after parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRule {
    pub url: String,
    pub agent_id: String,
    pub allowed_users: Option<Vec<String>>,
}

/// Per-rule failures. Any one of these fails registration fast; a partially
/// registered rule set is never sent.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("malformed rules XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("rule is missing required element <{0}>")]
    MissingField(&'static str),

    #[error("bad resource url {url}: {reason}")]
    BadUrl { url: String, reason: String },
}

#[derive(Default)]
struct RuleBuilder {
    url: Option<String>,
    agent_id: Option<String>,
    allowed_users: Option<Vec<String>>,
}

impl RuleBuilder {
    fn build(self) -> Result<ResourceRule, RuleError> {
        Ok(ResourceRule {
            url: self.url.ok_or(RuleError::MissingField("url"))?,
            agent_id: self.agent_id.ok_or(RuleError::MissingField("agentId"))?,
            allowed_users: self.allowed_users,
        })
    }
}

/// Parse every `<rule>` element in the document.
pub fn parse_rules(xml: &str) -> Result<Vec<ResourceRule>, RuleError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut rules = Vec::new();
    let mut current: Option<RuleBuilder> = None;
    let mut field: Option<&'static str> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"rule" => current = Some(RuleBuilder::default()),
                b"url" => field = Some("url"),
                b"agentId" => field = Some("agentId"),
                b"allowedEntities" => field = Some("allowedEntities"),
                _ => field = None,
            },
            Event::Text(text) => {
                if let (Some(builder), Some(name)) = (current.as_mut(), field) {
                    let value = text.unescape()?.into_owned();
                    match name {
                        "url" => builder.url = Some(value.trim().to_string()),
                        "agentId" => builder.agent_id = Some(value.trim().to_string()),
                        "allowedEntities" => {
                            let users: Vec<String> = value
                                .split(',')
                                .map(str::trim)
                                .filter(|s| !s.is_empty())
                                .map(String::from)
                                .collect();
                            if !users.is_empty() {
                                builder.allowed_users = Some(users);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"rule" => {
                    if let Some(builder) = current.take() {
                        rules.push(builder.build()?);
                    }
                }
                _ => field = None,
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(rules)
}

/// Parse the document and keep only the rules bound to `agent_id`.
pub fn rules_for_agent(xml: &str, agent_id: &str) -> Result<Vec<ResourceRule>, RuleError> {
    let rules = parse_rules(xml)?;
    Ok(rules
        .into_iter()
        .filter(|rule| rule.agent_id == agent_id)
        .collect())
}

/// Extract the `(host, port)` endpoint of a rule URL.
///
/// `http` and `https` URLs get their scheme default port when none is given;
/// `socket` URLs must carry an explicit port.
pub fn resource_endpoint(raw: &str) -> Result<(String, u16), RuleError> {
    let bad = |reason: &str| RuleError::BadUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|e| bad(&e.to_string()))?;

    let host = url.host_str().ok_or_else(|| bad("missing host"))?.to_string();

    let port = match url.scheme() {
        "http" => url.port().unwrap_or(80),
        "https" => url.port().unwrap_or(443),
        "socket" => url.port().ok_or_else(|| bad("socket url needs a port"))?,
        other => return Err(bad(&format!("unsupported scheme {other}"))),
    };

    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES_XML: &str = r#"<?xml version="1.0"?>
<resourceRules>
  <rule>
    <agentId>agent-1</agentId>
    <url>https://wiki.corp.example.com</url>
    <allowedEntities>alice@corp.example.com, bob@corp.example.com</allowedEntities>
  </rule>
  <rule>
    <agentId>agent-1</agentId>
    <url>socket://db.corp.example.com:5432</url>
  </rule>
  <rule>
    <agentId>other-agent</agentId>
    <url>http://old.corp.example.com:8080</url>
  </rule>
</resourceRules>
"#;

    #[test]
    fn parses_all_rules() {
        let rules = parse_rules(RULES_XML).unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].url, "https://wiki.corp.example.com");
        assert_eq!(
            rules[0].allowed_users.as_deref(),
            Some(
                &[
                    "alice@corp.example.com".to_string(),
                    "bob@corp.example.com".to_string()
                ][..]
            )
        );
        assert_eq!(rules[1].allowed_users, None);
    }

    #[test]
    fn filters_by_agent_binding() {
        let rules = rules_for_agent(RULES_XML, "agent-1").unwrap();
        assert_eq!(rules.len(), 2);

        let rules = rules_for_agent(RULES_XML, "nobody").unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn empty_document_yields_no_rules() {
        let rules = parse_rules("<resourceRules/>").unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn missing_url_fails_fast() {
        let xml = "<resourceRules><rule><agentId>a</agentId></rule></resourceRules>";
        let err = parse_rules(xml).unwrap_err();
        assert!(matches!(err, RuleError::MissingField("url")));
    }

    #[test]
    fn endpoint_extraction() {
        assert_eq!(
            resource_endpoint("https://wiki.corp.example.com").unwrap(),
            ("wiki.corp.example.com".to_string(), 443)
        );
        assert_eq!(
            resource_endpoint("http://old.corp.example.com:8080").unwrap(),
            ("old.corp.example.com".to_string(), 8080)
        );
        assert_eq!(
            resource_endpoint("socket://db.corp.example.com:5432").unwrap(),
            ("db.corp.example.com".to_string(), 5432)
        );
    }

    #[test]
    fn endpoint_rejects_bad_urls() {
        assert!(matches!(
            resource_endpoint("socket://db.corp.example.com"),
            Err(RuleError::BadUrl { .. })
        ));
        assert!(matches!(
            resource_endpoint("ftp://files.corp.example.com"),
            Err(RuleError::BadUrl { .. })
        ));
        assert!(matches!(
            resource_endpoint("not a url"),
            Err(RuleError::BadUrl { .. })
        ));
    }
}
