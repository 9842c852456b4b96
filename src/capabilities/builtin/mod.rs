mod url_fetch;
mod web_search;

pub use url_fetch::UrlFetchProvider;
pub use web_search::WebSearchProvider;

use tracing::info;

use crate::capabilities::RegistryBuilder;
use crate::config::CapabilitiesConfig;

/// Registers the builtin capabilities enabled in the configuration.
pub fn register_configured(
    builder: &mut RegistryBuilder,
    config: &CapabilitiesConfig,
) -> anyhow::Result<()> {
    if let Some(ref ws_config) = config.web_search {
        info!(
            "Registering builtin capability: web_search (provider: {})",
            ws_config.provider
        );
        builder.register(Box::new(WebSearchProvider::new(ws_config)?))?;
    }

    if config.url_fetch.enabled {
        info!("Registering builtin capability: url_fetch");
        builder.register(Box::new(UrlFetchProvider::new()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{UrlFetchConfig, WebSearchConfig};

    fn web_search(provider: &str) -> WebSearchConfig {
        WebSearchConfig {
            provider: provider.to_string(),
            api_key: "k".to_string(),
            max_results: 5,
            model: None,
        }
    }

    #[test]
    fn test_defaults_register_url_fetch_only() {
        let mut builder = RegistryBuilder::new();
        register_configured(&mut builder, &CapabilitiesConfig::default()).unwrap();
        assert_eq!(builder.build().names(), vec!["url_fetch"]);
    }

    #[test]
    fn test_register_everything() {
        let config = CapabilitiesConfig {
            web_search: Some(web_search("tavily")),
            url_fetch: UrlFetchConfig { enabled: true },
        };
        let mut builder = RegistryBuilder::new();
        register_configured(&mut builder, &config).unwrap();
        assert_eq!(builder.build().names(), vec!["url_fetch", "web_search"]);
    }

    #[test]
    fn test_nothing_enabled() {
        let config = CapabilitiesConfig {
            web_search: None,
            url_fetch: UrlFetchConfig { enabled: false },
        };
        let mut builder = RegistryBuilder::new();
        register_configured(&mut builder, &config).unwrap();
        assert!(builder.is_empty());
    }

    #[test]
    fn test_unsupported_provider_is_an_error() {
        let config = CapabilitiesConfig {
            web_search: Some(web_search("bing")),
            ..CapabilitiesConfig::default()
        };
        let mut builder = RegistryBuilder::new();
        assert!(register_configured(&mut builder, &config).is_err());
    }
}
