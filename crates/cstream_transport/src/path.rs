//! Parses the subscribe/snapshot upgrade path and query string (§6):
//! `/{prefix}/v{N}/changes?id=...&replicaVersion=...&watermark=...&initial=...`
//! and `/{prefix}/v{N}/snapshot`.

use cstream_types::{SubscribeRequest, SubscriberMode, Watermark};

use crate::error::{Result, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestedRoute {
    Changes,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub service_prefix: String,
    pub protocol_version: u32,
    pub route: RequestedRoute,
}

/// Parse `/{prefix}/v{N}/{changes|snapshot}`. The prefix may itself
/// contain slashes (it's an operator-chosen deployment path), so parsing
/// anchors on the last two segments rather than splitting greedily from
/// the front.
pub fn parse_path(path: &str) -> Result<ParsedPath> {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.len() < 2 {
        return Err(TransportError::MalformedRequest(format!(
            "path '{path}' has too few segments"
        )));
    }

    let route_str = segments[segments.len() - 1];
    let version_str = segments[segments.len() - 2];
    let prefix_segments = &segments[..segments.len() - 2];
    if prefix_segments.is_empty() {
        return Err(TransportError::MalformedRequest(format!(
            "path '{path}' is missing a service prefix"
        )));
    }

    let route = match route_str {
        "changes" => RequestedRoute::Changes,
        "snapshot" => RequestedRoute::Snapshot,
        other => {
            return Err(TransportError::MalformedRequest(format!(
                "unknown route '{other}'"
            )))
        }
    };

    let protocol_version = version_str
        .strip_prefix('v')
        .ok_or_else(|| TransportError::MalformedRequest(format!("bad version segment '{version_str}'")))?
        .parse::<u32>()
        .map_err(|_| TransportError::MalformedRequest(format!("bad version segment '{version_str}'")))?;

    Ok(ParsedPath {
        service_prefix: prefix_segments.join("/"),
        protocol_version,
        route,
    })
}

/// Parse the `subscribe` query string into a [`SubscribeRequest`].
/// Required: `id`, `replicaVersion`, `watermark`, `initial`. Optional:
/// `taskID`, `mode` (defaults to `serving`).
pub fn parse_subscribe_query(protocol_version: u32, query: &str) -> Result<SubscribeRequest> {
    let params = parse_query_string(query);
    let get = |key: &str| params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());

    let id = get("id")
        .ok_or_else(|| TransportError::MalformedRequest("missing 'id'".into()))?
        .to_string();
    let replica_version = get("replicaVersion")
        .ok_or_else(|| TransportError::MalformedRequest("missing 'replicaVersion'".into()))?;
    let watermark = get("watermark")
        .ok_or_else(|| TransportError::MalformedRequest("missing 'watermark'".into()))?;
    let initial = get("initial")
        .ok_or_else(|| TransportError::MalformedRequest("missing 'initial'".into()))?;
    let initial = match initial {
        "true" => true,
        "false" => false,
        other => {
            return Err(TransportError::MalformedRequest(format!(
                "invalid 'initial' value '{other}'"
            )))
        }
    };

    let mode = match get("mode") {
        Some(m) => SubscriberMode::parse(m)
            .ok_or_else(|| TransportError::MalformedRequest(format!("invalid 'mode' value '{m}'")))?,
        None => SubscriberMode::default(),
    };

    Ok(SubscribeRequest {
        protocol_version,
        id,
        replica_version: Watermark::from_raw(replica_version),
        watermark: Watermark::from_raw(watermark),
        initial,
        task_id: get("taskID").map(str::to_string),
        mode,
    })
}

/// A minimal `application/x-www-form-urlencoded`-ish query string parser:
/// splits on `&` then `=`, percent-decoding neither key nor value, since
/// every value accepted here (ids, watermarks, booleans) is already
/// URL-safe and the callers that produce these query strings do not
/// percent-encode them.
fn parse_query_string(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or("").to_string();
            Some((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_changes_path() {
        let parsed = parse_path("/sync/v2/changes").unwrap();
        assert_eq!(parsed.service_prefix, "sync");
        assert_eq!(parsed.protocol_version, 2);
        assert_eq!(parsed.route, RequestedRoute::Changes);
    }

    #[test]
    fn parses_snapshot_path_with_multi_segment_prefix() {
        let parsed = parse_path("/api/internal/sync/v1/snapshot").unwrap();
        assert_eq!(parsed.service_prefix, "api/internal/sync");
        assert_eq!(parsed.protocol_version, 1);
        assert_eq!(parsed.route, RequestedRoute::Snapshot);
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(parse_path("/v1/changes").is_err());
    }

    #[test]
    fn rejects_unknown_route() {
        assert!(parse_path("/sync/v1/unknown").is_err());
    }

    #[test]
    fn parses_full_subscribe_query() {
        let req = parse_subscribe_query(
            2,
            "id=sub-1&replicaVersion=01&watermark=03&initial=true&taskID=task-7&mode=backup",
        )
        .unwrap();
        assert_eq!(req.id, "sub-1");
        assert_eq!(req.replica_version.as_str(), "01");
        assert_eq!(req.watermark.as_str(), "03");
        assert!(req.initial);
        assert_eq!(req.task_id.as_deref(), Some("task-7"));
        assert_eq!(req.mode, SubscriberMode::Backup);
    }

    #[test]
    fn defaults_mode_to_serving() {
        let req = parse_subscribe_query(2, "id=s&replicaVersion=00&watermark=00&initial=false").unwrap();
        assert_eq!(req.mode, SubscriberMode::Serving);
    }

    #[test]
    fn rejects_missing_required_field() {
        assert!(parse_subscribe_query(2, "id=s&watermark=00&initial=false").is_err());
    }
}
