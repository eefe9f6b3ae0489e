use super::StoreError;
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode, SslVersion};
use postgres_openssl::MakeTlsConnector;
use shardfeed_types::{TlsConfig, TlsVersion};
use std::sync::Once;
use tracing::{debug, warn};

/// Builds the OpenSSL connector described by `config`.
///
/// Any certificate or key that cannot be loaded is an error: without it no
/// connection to the store can be made.
pub(super) fn tls_connector(config: &TlsConfig) -> Result<MakeTlsConnector, StoreError> {
    let mut builder = SslConnector::builder(SslMethod::tls()).map_err(|e| StoreError::Tls {
        hint: "unable to build TLS connector to connect to PostgreSQL".to_string(),
        source: Some(e),
    })?;

    if config.accept_invalid_certs {
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            warn!("PostgreSQL TLS verification is disabled -- not recommended for production environments.");
        });
        builder.set_verify(SslVerifyMode::NONE);
    }

    let version_error = |e| StoreError::Tls {
        hint: "unable to restrict the TLS protocol versions".to_string(),
        source: Some(e),
    };
    builder
        .set_min_proto_version(config.min_version.map(ssl_version))
        .map_err(version_error)?;
    builder
        .set_max_proto_version(config.max_version.map(ssl_version))
        .map_err(version_error)?;

    if let Some(ciphers) = &config.ciphers {
        builder.set_cipher_list(ciphers).map_err(|e| StoreError::Tls {
            hint: format!("invalid cipher list '{ciphers}'"),
            source: Some(e),
        })?;
    }

    if let Some(ca_file) = &config.ca_file {
        builder
            .set_ca_file(ca_file)
            .map_err(|e| StoreError::Tls {
                hint: format!("unable to load CA certificates from {}", ca_file.display()),
                source: Some(e),
            })?;
    }

    match (&config.cert_file, &config.key_file) {
        (Some(cert_file), Some(key_file)) => {
            debug!("using client certificate and key to connect to PostgreSQL");
            builder
                .set_certificate_chain_file(cert_file)
                .map_err(|e| StoreError::Tls {
                    hint: format!(
                        "unable to load client certificate from {}",
                        cert_file.display()
                    ),
                    source: Some(e),
                })?;
            builder
                .set_private_key_file(key_file, SslFiletype::PEM)
                .map_err(|e| StoreError::Tls {
                    hint: format!("unable to load client key from {}", key_file.display()),
                    source: Some(e),
                })?;
            builder.check_private_key().map_err(|e| StoreError::Tls {
                hint: "client key does not match client certificate".to_string(),
                source: Some(e),
            })?;
        }
        (None, None) => {}
        _ => {
            return Err(StoreError::Tls {
                hint: "client certificate and key must be configured together".to_string(),
                source: None,
            })
        }
    }

    let mut connector = MakeTlsConnector::new(builder.build());

    let verify_hostname = !config.accept_invalid_hostnames;
    if !verify_hostname {
        warn!("PostgreSQL TLS hostname verification is disabled. The PostgreSQL server's hostname may not match the one specified in the SSL certificate.");
    }

    match config.server_name.clone() {
        Some(server_name) => {
            debug!("using TLS server name '{server_name}'");
            connector.set_callback(move |ctx, _host| {
                // Replaces the connection host for both SNI and verification.
                ctx.set_use_server_name_indication(false);
                ctx.set_verify_hostname(false);
                ctx.set_hostname(&server_name)?;
                if verify_hostname {
                    ctx.param_mut().set_host(&server_name)?;
                }
                Ok(())
            });
        }
        None if !verify_hostname => {
            connector.set_callback(|ctx, _host| {
                ctx.set_verify_hostname(false);
                Ok(())
            });
        }
        None => {}
    }

    Ok(connector)
}

fn ssl_version(version: TlsVersion) -> SslVersion {
    match version {
        TlsVersion::Tls1_0 => SslVersion::TLS1,
        TlsVersion::Tls1_1 => SslVersion::TLS1_1,
        TlsVersion::Tls1_2 => SslVersion::TLS1_2,
        TlsVersion::Tls1_3 => SslVersion::TLS1_3,
    }
}
