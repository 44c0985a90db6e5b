use crate::{NodeKind, PropertyList, RepositoryInfo, ServerError, ServerErrorItem, SvnError};

use super::SvnItem;
use super::template::{Slot, Template};

/// Greeting parameters: `( minver maxver ( mech... ) ( cap... ) )`.
#[derive(Debug)]
pub(crate) struct Greeting {
    pub(crate) min_version: u64,
    pub(crate) max_version: u64,
    pub(crate) capabilities: Vec<String>,
}

pub(crate) fn parse_greeting(params: &[SvnItem]) -> Result<Greeting, SvnError> {
    let slots = Template::parse("nn(*w)(*w)")?.unmarshal(params)?;
    Ok(Greeting {
        min_version: number(&slots[0]),
        max_version: number(&slots[1]),
        capabilities: slots[3].words(),
    })
}

/// An `auth-request`: offered mechanisms and the server realm.
#[derive(Debug)]
pub(crate) struct AuthRequest {
    pub(crate) mechanisms: Vec<String>,
    pub(crate) realm: String,
}

pub(crate) fn parse_auth_request(params: &[SvnItem]) -> Result<AuthRequest, SvnError> {
    let slots = Template::parse("(*w)?s")?.unmarshal(params)?;
    Ok(AuthRequest {
        mechanisms: slots[0].words(),
        realm: slots[1].as_str().unwrap_or_default().to_string(),
    })
}

/// One server reply inside a SASL exchange.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Challenge {
    Step(Vec<u8>),
    Success,
    Failure(String),
}

pub(crate) fn parse_challenge(item: &SvnItem) -> Result<Challenge, SvnError> {
    let slots = super::template::unmarshal("w?(?b)", item)?;
    let token = slots[1]
        .as_list()
        .and_then(|list| list.first())
        .and_then(Slot::as_bytes)
        .map(<[u8]>::to_vec);
    match slots[0].as_word() {
        Some("step") => token
            .map(Challenge::Step)
            .ok_or_else(|| SvnError::Protocol("auth step missing token".into())),
        Some("success") => Ok(Challenge::Success),
        Some("failure") => Ok(Challenge::Failure(
            token
                .map(|t| String::from_utf8_lossy(&t).into_owned())
                .unwrap_or_else(|| "authentication failed".to_string()),
        )),
        other => Err(SvnError::Protocol(format!(
            "unexpected auth challenge: {}",
            other.unwrap_or_default()
        ))),
    }
}

pub(crate) fn parse_repos_info(params: &[SvnItem]) -> Result<RepositoryInfo, SvnError> {
    let slots = Template::parse("s?s(*w)")?.unmarshal(params)?;
    Ok(RepositoryInfo {
        uuid: slots[0].as_str().unwrap_or_default().to_string(),
        root_url: slots[1].as_str().unwrap_or_default().to_string(),
        capabilities: slots[2].words(),
    })
}

pub(crate) fn parse_server_error(items: &[SvnItem]) -> ServerError {
    let mut chain = Vec::new();
    for item in items {
        let SvnItem::List(parts) = item else {
            continue;
        };
        if parts.len() < 4 {
            continue;
        }

        chain.push(ServerErrorItem {
            code: parts[0].as_u64().unwrap_or(0),
            message: lossy_string(&parts[1]).filter(|m| !m.is_empty()),
            file: lossy_string(&parts[2]).filter(|s| !s.is_empty()),
            line: parts[3].as_u64(),
        });
    }

    ServerError {
        context: None,
        chain,
    }
}

fn lossy_string(item: &SvnItem) -> Option<String> {
    match item {
        SvnItem::String(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        SvnItem::Word(word) => Some(word.clone()),
        _ => None,
    }
}

pub(crate) fn parse_proplist(item: &SvnItem) -> Result<PropertyList, SvnError> {
    let SvnItem::List(entries) = item else {
        return Err(SvnError::Protocol("proplist not a list".into()));
    };
    let pair = Template::parse("sb")?;
    let mut props = PropertyList::new();
    for entry in entries {
        let SvnItem::List(items) = entry else {
            continue;
        };
        let Ok(slots) = pair.unmarshal(items) else {
            continue;
        };
        if let (Some(name), Some(value)) = (slots[0].as_str(), slots[1].as_bytes()) {
            props.insert(name.to_string(), value.to_vec());
        }
    }
    Ok(props)
}

/// `get-file` response parameters: `( ( ?checksum ) rev props )`.
#[derive(Debug)]
pub(crate) struct GetFileResponseParams {
    pub(crate) checksum: Option<String>,
    pub(crate) rev: u64,
    pub(crate) props: PropertyList,
}

pub(crate) fn parse_get_file_response_params(
    params: &[SvnItem],
) -> Result<GetFileResponseParams, SvnError> {
    let slots = Template::parse("(?s)n")?.unmarshal(params)?;
    let checksum = slots[0]
        .as_list()
        .and_then(|list| list.first())
        .and_then(Slot::as_str)
        .map(str::to_string);
    let props = match params.get(2) {
        Some(item) => parse_proplist(item)?,
        None => PropertyList::new(),
    };
    Ok(GetFileResponseParams {
        checksum,
        rev: number(&slots[1]),
        props,
    })
}

pub(crate) fn parse_latest_rev(params: &[SvnItem]) -> Result<u64, SvnError> {
    let slots = Template::parse("n")?.unmarshal(params)?;
    Ok(number(&slots[0]))
}

pub(crate) fn parse_node_kind(params: &[SvnItem]) -> Result<NodeKind, SvnError> {
    let slots = Template::parse("w")?.unmarshal(params)?;
    Ok(NodeKind::from_word(slots[0].as_word().unwrap_or_default()))
}

fn number(slot: &Slot) -> u64 {
    slot.as_number().unwrap_or_default()
}
