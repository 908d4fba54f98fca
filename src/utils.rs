//! Fetching proxy lists from configured sources.

use crate::config::SourceConfig;
use crate::error::PoolError;

use log::debug;
use reqwest::Client;
use url::Url;

/// Fetch and parse a list of proxies from a URL or file path.
///
/// HTTP sources are requested with basic auth when a username is set.
pub async fn fetch_proxies_from_source(client: &Client, source: &SourceConfig) -> Result<Vec<String>, PoolError> {
    let content = match Url::parse(&source.url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            let mut request = client.get(url);
            if let Some(username) = &source.username {
                request = request.basic_auth(username, source.password.as_deref());
            }
            request.send().await?.error_for_status()?.text().await?
        }
        _ => tokio::fs::read_to_string(&source.url)
            .await
            .map_err(|source_err| PoolError::SourceFile {
                path: source.url.clone(),
                source: source_err,
            })?,
    };

    let proxies = parse_proxy_list(&content);
    debug!("fetched {} proxies from {}", proxies.len(), source.url);
    Ok(proxies)
}

/// One address per line. Blank lines and `#` comments are skipped.
pub fn parse_proxy_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_lines_and_skips_comments() {
        let content = "1.1.1.1:80\r\n\n  # mirror\n 2.2.2.2:3128 \nuser:pw@3.3.3.3:8080\n";
        assert_eq!(
            parse_proxy_list(content),
            vec!["1.1.1.1:80", "2.2.2.2:3128", "user:pw@3.3.3.3:8080"]
        );
    }

    #[tokio::test]
    async fn reads_file_sources() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "4.4.4.4:80\n# skip\n5.5.5.5:81").unwrap();
        let source = SourceConfig {
            url: file.path().display().to_string(),
            username: None,
            password: None,
        };

        let proxies = fetch_proxies_from_source(&Client::new(), &source).await.unwrap();
        assert_eq!(proxies, vec!["4.4.4.4:80", "5.5.5.5:81"]);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let source = SourceConfig {
            url: "/definitely/not/here.txt".to_string(),
            username: None,
            password: None,
        };
        let result = fetch_proxies_from_source(&Client::new(), &source).await;
        assert!(matches!(result, Err(PoolError::SourceFile { .. })));
    }
}
