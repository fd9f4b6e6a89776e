use super::ZapiClient;
use crate::error::{PollError, Result};

/// Identity and version of the polled system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemInfo {
    pub name: String,
    pub serial: String,
    pub uuid: String,
    pub release: String,
    pub version: [u32; 3],
    pub clustered: bool,
}

impl SystemInfo {
    pub(crate) async fn fetch(client: &mut ZapiClient) -> Result<Self> {
        let mut system = SystemInfo::default();
        let response = client.invoke_name("system-get-version").await?;

        system.release = response.child_content("version").to_string();
        if let Some(tuple) = response.path("version-tuple.system-version-tuple") {
            for (i, part) in ["generation", "major", "minor"].iter().enumerate() {
                if let Ok(n) = tuple.child_content(part).parse() {
                    system.version[i] = n;
                }
            }
        }
        if system.version[0] == 0 {
            system.version = parse_release(&system.release).ok_or_else(|| {
                PollError::AttributeNotFound("version-tuple".to_string())
            })?;
        }

        system.clustered = match response.child_content("is-clustered") {
            "true" => true,
            "false" => false,
            _ => return Err(PollError::AttributeNotFound("is-clustered".to_string())),
        };

        if system.clustered {
            let response = client.invoke_name("cluster-identity-get").await?;
            let info = response
                .path("attributes.cluster-identity-info")
                .ok_or_else(|| PollError::AttributeNotFound("cluster-identity-info".to_string()))?;
            system.name = info.child_content("cluster-name").to_string();
            system.serial = info.child_content("cluster-serial-number").to_string();
            system.uuid = info.child_content("cluster-uuid").to_string();
        } else {
            let response = client.invoke_name("system-get-info").await?;
            let info = response
                .path("system-info")
                .ok_or_else(|| PollError::AttributeNotFound("system-info".to_string()))?;
            system.name = info.child_content("system-name").to_string();
            system.serial = info.child_content("system-serial-number").to_string();
            system.uuid = info.child_content("system-id").to_string();
        }
        Ok(system)
    }

    /// `generation.major.minor`.
    pub fn version_string(&self) -> String {
        let [g, ma, mi] = self.version;
        format!("{g}.{ma}.{mi}")
    }
}

/// Parses `NetApp Release 9.8.0: ...` style strings.
fn parse_release(release: &str) -> Option<[u32; 3]> {
    let rest = release.strip_prefix("NetApp Release ")?;
    let numbers: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numbers.split('.').map(|p| p.parse::<u32>().ok());
    Some([parts.next()??, parts.next()??, parts.next().flatten().unwrap_or(0)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_release_string() {
        assert_eq!(parse_release("NetApp Release 8.2.5 7-Mode: Wed Jun"), Some([8, 2, 5]));
        assert_eq!(parse_release("NetApp Release 9.1: Thu"), Some([9, 1, 0]));
        assert_eq!(parse_release("unknown"), None);
    }
}
