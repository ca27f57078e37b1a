//! Secret bundle export and import between devices of one user.

mod helpers;

use e2ee_client::{CryptoManager, CryptoManagerError, SecretImportError};
use e2ee_crypto::SecretBundle;
use helpers::{local_manager, pickle_key, user};

/// A device with cross-signing and backup set up, and its sealed secrets.
async fn exporting_device() -> (CryptoManager, SecretBundle) {
    let manager = local_manager().await;
    manager.bootstrap_cross_signing().await.unwrap();
    manager.enable_backup().await.unwrap();
    let bundle = manager.export_secrets(&pickle_key(7)).await.unwrap();
    (manager, bundle)
}

async fn assert_untouched(manager: &CryptoManager) {
    let store = manager.store();
    assert!(store.load_private_identity().await.unwrap().is_none());
    assert!(store.load_backup_key().await.unwrap().is_none());
    assert!(store.get_user_identity(&user("me")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_secrets_move_between_devices() {
    let (source, bundle) = exporting_device().await;
    let target = local_manager().await;

    target.import_secrets(&bundle, &pickle_key(7)).await.unwrap();

    assert_eq!(
        target.export_cross_signing_keys().await.unwrap(),
        source.export_cross_signing_keys().await.unwrap()
    );
    let source_recovery = source.enable_backup().await.unwrap();
    let target_key = target.store().load_backup_key().await.unwrap().unwrap();
    assert_eq!(*target_key.to_recovery_key(), *source_recovery);

    // The public identity came along, so the target can cross-sign.
    let identity = target
        .store()
        .get_user_identity(&user("me"))
        .await
        .unwrap()
        .unwrap();
    assert!(identity.is_consistent());
}

#[tokio::test]
async fn test_wrong_key_is_rejected() {
    let (_, bundle) = exporting_device().await;
    let target = local_manager().await;

    let result = target.import_secrets(&bundle, &pickle_key(99)).await;
    assert!(matches!(
        result,
        Err(CryptoManagerError::SecretImport(SecretImportError::InvalidMac))
    ));
    assert_untouched(&target).await;
}

#[tokio::test]
async fn test_tampered_bundle_is_rejected() {
    let (source, bundle) = exporting_device().await;
    let other = source.export_secrets(&pickle_key(7)).await.unwrap();
    let target = local_manager().await;

    // A ciphertext from another sealing does not match this MAC.
    let spliced = SecretBundle {
        ciphertext: other.ciphertext,
        ..bundle
    };
    let result = target.import_secrets(&spliced, &pickle_key(7)).await;
    assert!(matches!(
        result,
        Err(CryptoManagerError::SecretImport(SecretImportError::InvalidMac))
    ));
    assert_untouched(&target).await;
}

#[tokio::test]
async fn test_unknown_format_is_rejected() {
    let (_, bundle) = exporting_device().await;
    let target = local_manager().await;

    let future_version = SecretBundle {
        version: bundle.version + 1,
        ..bundle.clone()
    };
    let result = target.import_secrets(&future_version, &pickle_key(7)).await;
    assert!(matches!(
        result,
        Err(CryptoManagerError::SecretImport(SecretImportError::UnsupportedVersion(_)))
    ));

    let other_algorithm = SecretBundle {
        algorithm: "rot13".to_owned(),
        ..bundle
    };
    let result = target.import_secrets(&other_algorithm, &pickle_key(7)).await;
    assert!(matches!(
        result,
        Err(CryptoManagerError::SecretImport(SecretImportError::UnsupportedAlgorithm(_)))
    ));
    assert_untouched(&target).await;
}

#[tokio::test]
async fn test_keys_for_another_identity_are_refused() {
    let (_, bundle) = exporting_device().await;
    let target = local_manager().await;
    target.bootstrap_cross_signing().await.unwrap();
    let before = target.export_cross_signing_keys().await.unwrap();

    let result = target.import_secrets(&bundle, &pickle_key(7)).await;
    assert!(matches!(
        result,
        Err(CryptoManagerError::SecretImport(SecretImportError::MismatchedPublicKeys))
    ));
    assert_eq!(target.export_cross_signing_keys().await.unwrap(), before);
    assert!(target.store().load_backup_key().await.unwrap().is_none());
}
