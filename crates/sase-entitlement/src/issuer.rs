//! Entitlement and Certificate Issuance
//!
//! The issuer owns serial allocation, the per-consumer signing key cache and
//! the entitlement/certificate records. Certificates are a PEM-framed,
//! base64 JSON payload followed by an HMAC-SHA256 signature made with the
//! issuing identity's secret.

use crate::config::IssuerConfig;
use crate::ledger::PoolLedger;
use crate::model::{
    Certificate, CertificateSerial, Consumer, ConsumerUuid, Entitlement, EntitlementId, Product,
    ReservationToken, Serial,
};
use crate::rules::Verdict;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use sase_common::{EntitlementError, EntitlementResult, ResourceKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const CERT_BEGIN: &str = "-----BEGIN ENTITLEMENT CERTIFICATE-----";
const CERT_END: &str = "-----END ENTITLEMENT CERTIFICATE-----";
const KEY_BEGIN: &str = "-----BEGIN ENTITLEMENT KEY-----";
const KEY_END: &str = "-----END ENTITLEMENT KEY-----";

/// Consumer signing key, generated once per consumer
#[derive(Debug)]
struct ConsumerKey {
    pem: String,
    fingerprint: String,
}

impl ConsumerKey {
    fn generate() -> Self {
        let mut material = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut material);

        Self {
            pem: format!("{KEY_BEGIN}\n{}\n{KEY_END}\n", STANDARD.encode(material)),
            fingerprint: hex::encode(Sha256::digest(material)),
        }
    }
}

/// Signed content of an entitlement certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificatePayload {
    /// Certificate serial
    pub serial: Serial,
    /// Issuing identity name
    pub issuer: String,
    /// Consumer the certificate was issued to
    pub consumer_uuid: ConsumerUuid,
    /// Entitlement the certificate proves
    pub entitlement_id: EntitlementId,
    /// Pool the unit was taken from
    pub pool_id: String,
    /// Entitled product
    pub product_id: String,
    /// SHA-256 of the consumer key material, hex
    pub key_fingerprint: String,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

#[derive(Default)]
struct Records {
    entitlements: HashMap<EntitlementId, Entitlement>,
    certificates: HashMap<Serial, Certificate>,
    /// Entitlement ids per consumer, in issue order
    by_consumer: HashMap<ConsumerUuid, Vec<EntitlementId>>,
}

impl Records {
    fn insert(&mut self, entitlement: Entitlement, certificate: Certificate) {
        self.by_consumer
            .entry(entitlement.consumer_uuid)
            .or_default()
            .push(entitlement.id);
        self.certificates.insert(certificate.serial, certificate);
        self.entitlements.insert(entitlement.id, entitlement);
    }

    fn remove(&mut self, entitlement: &Entitlement) {
        self.entitlements.remove(&entitlement.id);
        self.certificates.remove(&entitlement.certificate_serial);
        if let Some(ids) = self.by_consumer.get_mut(&entitlement.consumer_uuid) {
            ids.retain(|id| *id != entitlement.id);
            if ids.is_empty() {
                self.by_consumer.remove(&entitlement.consumer_uuid);
            }
        }
    }

    fn for_consumer(&self, uuid: &ConsumerUuid) -> impl Iterator<Item = &Entitlement> {
        self.by_consumer
            .get(uuid)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.entitlements.get(id))
    }
}

/// Entitlement issuer
pub struct EntitlementIssuer {
    name: String,
    secret: Vec<u8>,
    validity: Duration,
    next_serial: AtomicU64,
    keys: DashMap<ConsumerUuid, Arc<ConsumerKey>>,
    records: RwLock<Records>,
}

impl EntitlementIssuer {
    /// Create issuer for the configured identity
    pub fn new(config: &IssuerConfig) -> EntitlementResult<Self> {
        config.validate()?;
        if config.uses_default_secret() {
            warn!(issuer = %config.name, "Signing with the built-in default secret; certificates are forgeable");
        }

        Ok(Self {
            name: config.name.clone(),
            secret: config.signing_secret.as_bytes().to_vec(),
            validity: Duration::days(config.validity_days),
            next_serial: AtomicU64::new(config.serial_start),
            keys: DashMap::new(),
            records: RwLock::new(Records::default()),
        })
    }

    /// Issuing identity name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn key_for(&self, consumer: ConsumerUuid) -> Arc<ConsumerKey> {
        self.keys
            .entry(consumer)
            .or_insert_with(|| Arc::new(ConsumerKey::generate()))
            .value()
            .clone()
    }

    /// Signing key issued to `consumer`, if it has been issued anything
    pub fn consumer_key(&self, consumer: &ConsumerUuid) -> Option<String> {
        self.keys.get(consumer).map(|k| k.pem.clone())
    }

    fn allocate_serial(&self) -> Serial {
        self.next_serial.fetch_add(1, Ordering::SeqCst)
    }

    fn sign(&self, data: &[u8]) -> EntitlementResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| EntitlementError::Config(format!("signing key rejected: {e}")))?;
        mac.update(data);
        Ok(mac)
    }

    /// Build and sign a fresh certificate for `entitlement` under a new serial
    fn mint(&self, entitlement: &Entitlement, key: &ConsumerKey) -> EntitlementResult<Certificate> {
        let serial = self.allocate_serial();
        let issued_at = Utc::now();
        let expires_at = issued_at + self.validity;

        let payload = CertificatePayload {
            serial,
            issuer: self.name.clone(),
            consumer_uuid: entitlement.consumer_uuid,
            entitlement_id: entitlement.id,
            pool_id: entitlement.pool_id.clone(),
            product_id: entitlement.product_id.clone(),
            key_fingerprint: key.fingerprint.clone(),
            not_before: issued_at,
            not_after: expires_at,
        };
        let encoded = serde_json::to_vec(&payload)
            .map(|json| STANDARD.encode(json))
            .map_err(|e| EntitlementError::Storage(format!("certificate payload: {e}")))?;
        let signature = hex::encode(self.sign(encoded.as_bytes())?.finalize().into_bytes());

        Ok(Certificate {
            serial,
            key: key.pem.clone(),
            cert_body: format!("{CERT_BEGIN}\n{encoded}.{signature}\n{CERT_END}\n"),
            entitlement_id: entitlement.id,
            consumer_uuid: entitlement.consumer_uuid,
            product_id: entitlement.product_id.clone(),
            issued_at,
            expires_at,
        })
    }

    /// Mint an entitlement and certificate for a reserved pool unit.
    ///
    /// The reservation is not released on failure; the caller holds the
    /// token and decides.
    pub fn issue(
        &self,
        consumer: &Consumer,
        reservation: ReservationToken,
        product: &Product,
    ) -> EntitlementResult<Entitlement> {
        self.issue_if(consumer, reservation, product, |_| Ok(Verdict::Allow))
    }

    /// Like [`issue`](Self::issue), but `check` first sees the consumer's
    /// current entitlements under the records write lock.
    ///
    /// A [`Verdict::Deny`] becomes [`EntitlementError::RuleViolation`] and
    /// nothing is recorded. Concurrent issues for the same consumer are
    /// serialized against the check.
    pub fn issue_if<F>(
        &self,
        consumer: &Consumer,
        reservation: ReservationToken,
        product: &Product,
        check: F,
    ) -> EntitlementResult<Entitlement>
    where
        F: FnOnce(&[Entitlement]) -> EntitlementResult<Verdict>,
    {
        let mut records = self.records.write();
        let held: Vec<Entitlement> = records.for_consumer(&consumer.uuid).cloned().collect();
        check(held.as_slice())?.into_result()?;

        let key = self.key_for(consumer.uuid);

        let mut entitlement = Entitlement {
            id: Uuid::new_v4(),
            consumer_uuid: consumer.uuid,
            pool_id: reservation.pool_id.clone(),
            product_id: product.id.clone(),
            certificate_serial: 0,
            reservation,
            created_at: Utc::now(),
        };
        let certificate = self.mint(&entitlement, &key)?;
        entitlement.certificate_serial = certificate.serial;

        if records.certificates.contains_key(&certificate.serial) {
            return Err(EntitlementError::Conflict(format!(
                "serial {} already issued",
                certificate.serial
            )));
        }
        records.insert(entitlement.clone(), certificate);

        info!(
            consumer = %consumer.uuid,
            entitlement = %entitlement.id,
            pool = %entitlement.pool_id,
            product = %entitlement.product_id,
            serial = entitlement.certificate_serial,
            "Issued entitlement"
        );
        Ok(entitlement)
    }

    /// Reissue an entitlement's certificate under a new serial.
    ///
    /// The consumer key is kept; the previous certificate is dropped.
    pub fn regenerate(&self, id: &EntitlementId) -> EntitlementResult<Certificate> {
        let mut records = self.records.write();
        self.regenerate_locked(&mut records, id)
    }

    fn regenerate_locked(&self, records: &mut Records, id: &EntitlementId) -> EntitlementResult<Certificate> {
        let entitlement = records
            .entitlements
            .get(id)
            .cloned()
            .ok_or_else(|| EntitlementError::not_found(ResourceKind::Entitlement, id.to_string()))?;

        let key = self.key_for(entitlement.consumer_uuid);
        let certificate = self.mint(&entitlement, &key)?;

        records.certificates.remove(&entitlement.certificate_serial);
        records.certificates.insert(certificate.serial, certificate.clone());
        if let Some(stored) = records.entitlements.get_mut(id) {
            stored.certificate_serial = certificate.serial;
        }

        info!(
            entitlement = %id,
            old_serial = entitlement.certificate_serial,
            serial = certificate.serial,
            "Regenerated certificate"
        );
        Ok(certificate)
    }

    /// Regenerate every certificate for `product_id`, returning how many
    pub fn regenerate_for_product(&self, product_id: &str) -> EntitlementResult<usize> {
        let mut records = self.records.write();
        let mut ids: Vec<_> = records
            .entitlements
            .values()
            .filter(|e| e.product_id == product_id)
            .map(|e| (e.certificate_serial, e.id))
            .collect();
        ids.sort();

        for (_, id) in &ids {
            self.regenerate_locked(&mut records, id)?;
        }
        Ok(ids.len())
    }

    /// Revoke an entitlement and free its pool unit.
    ///
    /// The reservation is released before the records are removed; if the
    /// release fails the entitlement stays in place.
    pub fn revoke(&self, id: &EntitlementId, ledger: &PoolLedger) -> EntitlementResult<Entitlement> {
        let mut records = self.records.write();
        Self::revoke_locked(&mut records, id, ledger)
    }

    fn revoke_locked(
        records: &mut Records,
        id: &EntitlementId,
        ledger: &PoolLedger,
    ) -> EntitlementResult<Entitlement> {
        let entitlement = records
            .entitlements
            .get(id)
            .cloned()
            .ok_or_else(|| EntitlementError::not_found(ResourceKind::Entitlement, id.to_string()))?;

        if !ledger.release(&entitlement.reservation)? {
            warn!(entitlement = %id, "Reservation was already released");
        }
        records.remove(&entitlement);

        info!(
            consumer = %entitlement.consumer_uuid,
            entitlement = %id,
            pool = %entitlement.pool_id,
            serial = entitlement.certificate_serial,
            "Revoked entitlement"
        );
        Ok(entitlement)
    }

    /// Revoke everything held by `consumer`.
    ///
    /// All or nothing: every reservation is checked against the ledger
    /// before the first one is released.
    pub fn revoke_consumer(&self, consumer: &ConsumerUuid, ledger: &PoolLedger) -> EntitlementResult<Vec<Entitlement>> {
        let mut records = self.records.write();
        let ids: Vec<_> = records.by_consumer.get(consumer).cloned().unwrap_or_default();

        for entitlement in records.for_consumer(consumer) {
            ledger.check_release(&entitlement.reservation)?;
        }

        ids.iter()
            .map(|id| Self::revoke_locked(&mut records, id, ledger))
            .collect()
    }

    /// Get entitlement by ID
    pub fn entitlement(&self, id: &EntitlementId) -> EntitlementResult<Entitlement> {
        self.records
            .read()
            .entitlements
            .get(id)
            .cloned()
            .ok_or_else(|| EntitlementError::not_found(ResourceKind::Entitlement, id.to_string()))
    }

    /// Get certificate by serial
    pub fn certificate(&self, serial: Serial) -> EntitlementResult<Certificate> {
        self.records
            .read()
            .certificates
            .get(&serial)
            .cloned()
            .ok_or_else(|| EntitlementError::not_found(ResourceKind::Certificate, serial.to_string()))
    }

    /// Consumer's entitlements in issue order
    pub fn entitlements_for(&self, consumer: &ConsumerUuid) -> Vec<Entitlement> {
        self.records.read().for_consumer(consumer).cloned().collect()
    }

    /// Consumer's certificates in entitlement issue order
    pub fn certificates_for(&self, consumer: &ConsumerUuid) -> Vec<Certificate> {
        let records = self.records.read();
        records
            .for_consumer(consumer)
            .filter_map(|e| records.certificates.get(&e.certificate_serial))
            .cloned()
            .collect()
    }

    /// Serials and expiry of the consumer's certificates
    pub fn serials_for(&self, consumer: &ConsumerUuid) -> Vec<CertificateSerial> {
        self.certificates_for(consumer)
            .into_iter()
            .map(|c| CertificateSerial {
                serial: c.serial,
                expires_at: c.expires_at,
            })
            .collect()
    }

    /// Number of live entitlements
    pub fn entitlement_count(&self) -> usize {
        self.records.read().entitlements.len()
    }

    fn split_body(cert_body: &str) -> Option<(&str, &str)> {
        let inner = cert_body
            .trim()
            .strip_prefix(CERT_BEGIN)?
            .strip_suffix(CERT_END)?
            .trim();
        inner.split_once('.')
    }

    /// Whether the certificate body was signed by this issuer
    pub fn verify(&self, certificate: &Certificate) -> bool {
        let Some((encoded, signature)) = Self::split_body(&certificate.cert_body) else {
            return false;
        };
        let Ok(signature) = hex::decode(signature) else {
            return false;
        };
        self.sign(encoded.as_bytes())
            .map(|mac| mac.verify_slice(&signature).is_ok())
            .unwrap_or(false)
    }

    /// Decode the signed payload of a certificate
    pub fn payload(certificate: &Certificate) -> EntitlementResult<CertificatePayload> {
        let (encoded, _) = Self::split_body(&certificate.cert_body)
            .ok_or_else(|| EntitlementError::Validation("malformed certificate body".into()))?;
        let json = STANDARD
            .decode(encoded)
            .map_err(|e| EntitlementError::Validation(format!("certificate payload: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| EntitlementError::Validation(format!("certificate payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConsumerType;
    use crate::rules::codes;
    use sase_common::RuleCode;
    use std::collections::HashSet;
    use std::thread;

    fn issuer() -> EntitlementIssuer {
        EntitlementIssuer::new(&IssuerConfig::default()).unwrap()
    }

    fn ledger_with(pool: &str, quantity: u64) -> PoolLedger {
        let ledger = PoolLedger::new();
        ledger.open(pool, quantity).unwrap();
        ledger
    }

    #[test]
    fn test_same_consumer_shares_key() {
        let issuer = issuer();
        let ledger = ledger_with("pool-1", 10);
        let consumer = Consumer::new("host1", ConsumerType::PhysicalSystem, "acme");

        issuer.issue(&consumer, ledger.reserve("pool-1").unwrap(), &Product::new("monitoring", "M")).unwrap();
        issuer.issue(&consumer, ledger.reserve("pool-1").unwrap(), &Product::new("provisioning", "P")).unwrap();

        let certs = issuer.certificates_for(&consumer.uuid);
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0].key, certs[1].key);
        assert_ne!(certs[0].cert_body, certs[1].cert_body);
        assert_ne!(certs[0].serial, certs[1].serial);
        assert_eq!(issuer.consumer_key(&consumer.uuid).as_deref(), Some(certs[0].key.as_str()));
    }

    #[test]
    fn test_different_consumers_get_different_keys() {
        let issuer = issuer();
        let ledger = ledger_with("pool-1", 10);
        let product = Product::new("monitoring", "M");
        let a = Consumer::new("a", ConsumerType::PhysicalSystem, "acme");
        let b = Consumer::new("b", ConsumerType::PhysicalSystem, "acme");

        issuer.issue(&a, ledger.reserve("pool-1").unwrap(), &product).unwrap();
        issuer.issue(&b, ledger.reserve("pool-1").unwrap(), &product).unwrap();

        assert_ne!(issuer.consumer_key(&a.uuid), issuer.consumer_key(&b.uuid));
    }

    #[test]
    fn test_certificate_signature() {
        let issuer = issuer();
        let ledger = ledger_with("pool-1", 1);
        let consumer = Consumer::new("host1", ConsumerType::PhysicalSystem, "acme");

        let ent = issuer.issue(&consumer, ledger.reserve("pool-1").unwrap(), &Product::new("monitoring", "M")).unwrap();
        let cert = issuer.certificate(ent.certificate_serial).unwrap();
        assert!(issuer.verify(&cert));

        let payload = EntitlementIssuer::payload(&cert).unwrap();
        assert_eq!(payload.serial, cert.serial);
        assert_eq!(payload.entitlement_id, ent.id);
        assert_eq!(payload.issuer, issuer.name());

        let mut forged = cert.clone();
        forged.cert_body = forged.cert_body.replacen('.', "x.", 1);
        assert!(!issuer.verify(&forged));

        let other = EntitlementIssuer::new(&IssuerConfig {
            signing_secret: "another-secret".into(),
            ..IssuerConfig::default()
        })
        .unwrap();
        assert!(!other.verify(&cert));
    }

    #[test]
    fn test_serial_start() {
        let issuer = EntitlementIssuer::new(&IssuerConfig {
            serial_start: 1000,
            ..IssuerConfig::default()
        })
        .unwrap();
        let ledger = ledger_with("pool-1", 2);
        let consumer = Consumer::new("host1", ConsumerType::PhysicalSystem, "acme");

        let ent = issuer.issue(&consumer, ledger.reserve("pool-1").unwrap(), &Product::new("m", "M")).unwrap();
        assert_eq!(ent.certificate_serial, 1000);
    }

    #[test]
    fn test_revoke_frees_capacity() {
        let issuer = issuer();
        let ledger = ledger_with("pool-1", 1);
        let consumer = Consumer::new("host1", ConsumerType::PhysicalSystem, "acme");

        let ent = issuer.issue(&consumer, ledger.reserve("pool-1").unwrap(), &Product::new("m", "M")).unwrap();
        assert_eq!(ledger.remaining("pool-1").unwrap(), 0);

        issuer.revoke(&ent.id, &ledger).unwrap();
        assert_eq!(ledger.remaining("pool-1").unwrap(), 1);
        assert!(issuer.entitlements_for(&consumer.uuid).is_empty());
        assert!(issuer.certificate(ent.certificate_serial).is_err());

        assert!(matches!(
            issuer.revoke(&ent.id, &ledger),
            Err(EntitlementError::NotFound { kind: ResourceKind::Entitlement, .. })
        ));
    }

    #[test]
    fn test_revoke_after_reservation_released() {
        let issuer = issuer();
        let ledger = ledger_with("pool-1", 1);
        let consumer = Consumer::new("host1", ConsumerType::PhysicalSystem, "acme");
        let ent = issuer.issue(&consumer, ledger.reserve("pool-1").unwrap(), &Product::new("m", "M")).unwrap();

        assert!(ledger.release(&ent.reservation).unwrap());

        // The unit is not freed twice and the records still go away
        issuer.revoke(&ent.id, &ledger).unwrap();
        assert_eq!(ledger.consumed("pool-1").unwrap(), 0);
        assert_eq!(issuer.entitlement_count(), 0);
    }

    #[test]
    fn test_regenerate_keeps_key() {
        let issuer = issuer();
        let ledger = ledger_with("pool-1", 5);
        let consumer = Consumer::new("host1", ConsumerType::PhysicalSystem, "acme");
        let product = Product::new("monitoring", "M");

        let first = issuer.issue(&consumer, ledger.reserve("pool-1").unwrap(), &product).unwrap();
        let _second = issuer.issue(&consumer, ledger.reserve("pool-1").unwrap(), &Product::new("other", "O")).unwrap();
        let old = issuer.certificate(first.certificate_serial).unwrap();

        assert_eq!(issuer.regenerate_for_product("monitoring").unwrap(), 1);

        let updated = issuer.entitlement(&first.id).unwrap();
        assert_ne!(updated.certificate_serial, first.certificate_serial);
        assert!(issuer.certificate(first.certificate_serial).is_err());

        let new = issuer.certificate(updated.certificate_serial).unwrap();
        assert_eq!(new.key, old.key);
        assert_ne!(new.cert_body, old.cert_body);
        assert_eq!(issuer.certificates_for(&consumer.uuid).len(), 2);
        assert_eq!(ledger.consumed("pool-1").unwrap(), 2);
    }

    #[test]
    fn test_revoke_consumer() {
        let issuer = issuer();
        let ledger = ledger_with("pool-1", 5);
        let consumer = Consumer::new("host1", ConsumerType::PhysicalSystem, "acme");

        for product in ["a", "b", "c"] {
            issuer.issue(&consumer, ledger.reserve("pool-1").unwrap(), &Product::new(product, product)).unwrap();
        }

        let revoked = issuer.revoke_consumer(&consumer.uuid, &ledger).unwrap();
        assert_eq!(revoked.len(), 3);
        assert_eq!(ledger.consumed("pool-1").unwrap(), 0);
        assert_eq!(issuer.entitlement_count(), 0);
    }

    #[test]
    fn test_issue_if_denial_records_nothing() {
        let issuer = issuer();
        let ledger = ledger_with("pool-1", 5);
        let consumer = Consumer::new("host1", ConsumerType::PhysicalSystem, "acme");
        let product = Product::new("monitoring", "M");
        let first = issuer.issue(&consumer, ledger.reserve("pool-1").unwrap(), &product).unwrap();

        let result = issuer.issue_if(&consumer, ledger.reserve("pool-1").unwrap(), &product, |held| {
            assert_eq!(held.len(), 1);
            assert_eq!(held[0].id, first.id);
            Ok(Verdict::Deny(RuleCode::from_static(codes::ALREADY_HAS_PRODUCT)))
        });

        assert!(matches!(
            result,
            Err(EntitlementError::RuleViolation(code)) if code == RuleCode::from_static(codes::ALREADY_HAS_PRODUCT)
        ));
        assert_eq!(issuer.entitlement_count(), 1);
        assert_eq!(issuer.certificates_for(&consumer.uuid).len(), 1);
    }

    #[test]
    fn test_revoke_keeps_records_when_release_fails() {
        let issuer = issuer();
        let ledger = ledger_with("pool-1", 1);
        let consumer = Consumer::new("host1", ConsumerType::PhysicalSystem, "acme");
        let ent = issuer.issue(&consumer, ledger.reserve("pool-1").unwrap(), &Product::new("m", "M")).unwrap();

        ledger.forget_pool("pool-1");

        assert!(matches!(
            issuer.revoke(&ent.id, &ledger),
            Err(EntitlementError::NotFound { kind: ResourceKind::Pool, .. })
        ));
        assert_eq!(issuer.entitlement(&ent.id).unwrap(), ent);
        assert!(issuer.certificate(ent.certificate_serial).is_ok());
        assert!(ledger.is_outstanding(&ent.reservation));
    }

    #[test]
    fn test_revoke_consumer_is_all_or_nothing() {
        let issuer = issuer();
        let ledger = PoolLedger::new();
        ledger.open("pool-a", 1).unwrap();
        ledger.open("pool-b", 1).unwrap();
        let consumer = Consumer::new("host1", ConsumerType::PhysicalSystem, "acme");

        issuer.issue(&consumer, ledger.reserve("pool-a").unwrap(), &Product::new("a", "A")).unwrap();
        issuer.issue(&consumer, ledger.reserve("pool-b").unwrap(), &Product::new("b", "B")).unwrap();
        ledger.forget_pool("pool-b");

        assert!(issuer.revoke_consumer(&consumer.uuid, &ledger).is_err());
        assert_eq!(issuer.entitlements_for(&consumer.uuid).len(), 2);
        assert_eq!(issuer.certificates_for(&consumer.uuid).len(), 2);
        assert_eq!(ledger.consumed("pool-a").unwrap(), 1);
        assert_eq!(ledger.outstanding(), 2);
    }

    #[test]
    fn test_concurrent_serials_unique() {
        let issuer = Arc::new(issuer());
        let ledger = Arc::new(ledger_with("pool-1", 400));

        let mut handles = Vec::new();
        for t in 0..8 {
            let issuer = issuer.clone();
            let ledger = ledger.clone();
            handles.push(thread::spawn(move || {
                let consumer = Consumer::new(format!("host{t}"), ConsumerType::PhysicalSystem, "acme");
                (0..50)
                    .map(|_| {
                        let token = ledger.reserve("pool-1").unwrap();
                        issuer.issue(&consumer, token, &Product::new("m", "M")).unwrap().certificate_serial
                    })
                    .collect::<Vec<_>>()
            }));
        }

        let serials: Vec<Serial> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let unique: HashSet<_> = serials.iter().copied().collect();
        assert_eq!(serials.len(), 400);
        assert_eq!(unique.len(), 400);
    }

    #[test]
    fn test_concurrent_first_issue_shares_key() {
        let issuer = Arc::new(issuer());
        let ledger = Arc::new(ledger_with("pool-1", 16));
        let consumer = Consumer::new("host1", ConsumerType::PhysicalSystem, "acme");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let issuer = issuer.clone();
                let ledger = ledger.clone();
                let consumer = consumer.clone();
                thread::spawn(move || {
                    let token = ledger.reserve("pool-1").unwrap();
                    issuer.issue(&consumer, token, &Product::new("m", "M")).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let keys: HashSet<_> = issuer.certificates_for(&consumer.uuid).into_iter().map(|c| c.key).collect();
        assert_eq!(keys.len(), 1);
    }
}
