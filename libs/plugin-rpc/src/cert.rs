use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};

use crate::error::TransportError;

/// A self-signed, one-shot identity generated fresh per plugin launch.
/// Authenticity of the channel comes from the handshake line itself
/// (written over the already-trusted stdio pipe), not from a CA —
/// matching `spec.md` §4.3's "self-signed, one-shot" wording.
pub struct OneShotIdentity {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

pub fn generate(subject_alt_name: &str) -> Result<OneShotIdentity, TransportError> {
    let cert = rcgen::generate_simple_self_signed(vec![subject_alt_name.to_string()])
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let key_der = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
    let cert_der = cert.cert.der().clone();
    Ok(OneShotIdentity { cert_der, key_der })
}

/// Server (plugin) side config for a mutually-authenticated channel: it
/// presents `identity` and requires the peer to present exactly
/// `expected_client_cert` — the client identity the host announced to
/// the plugin via the launch environment before spawn (go-plugin's
/// AutoMTLS scheme, adapted to this spec's handshake-line transport).
pub fn server_config(
    identity: &OneShotIdentity,
    expected_client_cert: CertificateDer<'static>,
) -> Result<ServerConfig, TransportError> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(PinnedClientCertVerifier { expected: expected_client_cert }))
        .with_single_cert(vec![identity.cert_der.clone()], identity.key_der.clone_key())
        .map_err(|e| TransportError::Tls(e.to_string()))
}

/// Client (host) config that trusts exactly one server certificate — the
/// DER bytes handed over in the handshake line — and in turn presents
/// `client_identity` so the plugin can pin it back. No hostname check,
/// no CA chain — the pinned bytes on both sides are the whole trust
/// anchor, matching `spec.md` §4.3's "mutually-authenticated … TLS
/// channel whose credentials are exchanged in the handshake".
pub fn client_config(
    expected_server_cert: CertificateDer<'static>,
    client_identity: &OneShotIdentity,
) -> Result<ClientConfig, TransportError> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerCertVerifier { expected: expected_server_cert }))
        .with_client_auth_cert(vec![client_identity.cert_der.clone()], client_identity.key_der.clone_key())
        .map_err(|e| TransportError::Tls(e.to_string()))
}

#[derive(Debug)]
struct PinnedServerCertVerifier {
    expected: CertificateDer<'static>,
}

impl ServerCertVerifier for PinnedServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.expected.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General("plugin certificate does not match handshake".into()))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

#[derive(Debug)]
struct PinnedClientCertVerifier {
    expected: CertificateDer<'static>,
}

impl ClientCertVerifier for PinnedClientCertVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.expected.as_ref() {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::General("client certificate does not match handshake".into()))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

fn supported_schemes() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::RSA_PKCS1_SHA256,
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::RSA_PKCS1_SHA384,
        SignatureScheme::ECDSA_NISTP384_SHA384,
        SignatureScheme::RSA_PKCS1_SHA512,
        SignatureScheme::ED25519,
        SignatureScheme::RSA_PSS_SHA256,
        SignatureScheme::RSA_PSS_SHA384,
        SignatureScheme::RSA_PSS_SHA512,
    ]
}
