use std::path::PathBuf;

use anyhow::Context as _;
use hyper::Uri;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_RECORDINGS_DIR: &str = "./recordings";

const MIN_PORT: u16 = 1025;

#[derive(Debug, Clone)]
pub struct Config {
    /// Backend targets, selected round-robin per request.
    pub targets: Vec<Uri>,
    pub port: u16,
    pub recordings_dir: PathBuf,
}

impl Config {
    pub fn from_args(
        targets: &[String],
        port: u16,
        recordings_dir: PathBuf,
    ) -> anyhow::Result<Self> {
        if targets.is_empty() {
            anyhow::bail!("at least one target URL is required");
        }
        if port < MIN_PORT {
            anyhow::bail!("invalid port {port}: expected a value in 1025-65535");
        }
        let targets = targets
            .iter()
            .map(|raw| parse_target(raw))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            targets,
            port,
            recordings_dir,
        })
    }
}

fn parse_target(raw: &str) -> anyhow::Result<Uri> {
    let uri: Uri = raw
        .parse()
        .with_context(|| format!("parse target URL `{raw}`"))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => anyhow::bail!("target URL `{raw}` must use http or https"),
    }
    if uri.authority().is_none() {
        anyhow::bail!("target URL `{raw}` has no host");
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::Config;

    fn recordings_dir() -> PathBuf {
        PathBuf::from("./recordings")
    }

    #[test]
    fn accepts_http_and_https_targets() {
        let config = Config::from_args(
            &[
                "http://127.0.0.1:3000".to_owned(),
                "https://backend.test/".to_owned(),
            ],
            8080,
            recordings_dir(),
        )
        .unwrap();

        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn rejects_missing_targets() {
        let err = Config::from_args(&[], 8080, recordings_dir()).unwrap_err();
        assert!(err.to_string().contains("at least one target"));
    }

    #[test]
    fn rejects_privileged_ports() {
        let err = Config::from_args(&["http://127.0.0.1:3000".to_owned()], 80, recordings_dir())
            .unwrap_err();
        assert!(err.to_string().contains("invalid port"));
    }

    #[test]
    fn rejects_non_http_targets() {
        let cases = ["ftp://host", "127.0.0.1:3000", "http://"];
        for case in cases {
            assert!(
                Config::from_args(&[case.to_owned()], 8080, recordings_dir()).is_err(),
                "target `{case}` should be rejected"
            );
        }
    }
}
