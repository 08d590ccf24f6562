//! Key cache management through the public API.

use datapath_e2e::*;
use skylark_wlan::keycache::{CipherKind, KeyMaterial};
use skylark_wlan::WlanError;

#[test]
fn global_keys_live_in_their_reserved_slots() {
    let (dev, _vap, _peer) = ap_with_station();
    for ix in 0..4u16 {
        let slot = dev
            .key_set_global(ix, KeyMaterial::new(CipherKind::AesCcm, &[ix as u8; 16]))
            .unwrap();
        assert_eq!(slot, ix);
    }
    assert!(matches!(
        dev.key_set_global(4, KeyMaterial::new(CipherKind::AesCcm, &[0u8; 16])),
        Err(WlanError::InvalidKeyIndex(4))
    ));
}

#[test]
fn pairwise_key_follows_the_peer_lifecycle() {
    let (dev, vap, peer) = ap_with_station();
    let slot = dev
        .key_set_peer(peer, KeyMaterial::new(CipherKind::AesCcm, &[1u8; 16]))
        .unwrap();
    assert!(dev.with_hal(|hal| hal.key_slot(slot).is_some()));

    // Removing the peer releases its slots; the next association can
    // reuse them.
    dev.remove_peer(peer).unwrap();
    assert!(dev.with_hal(|hal| hal.key_resets().contains(&slot)));

    let peer2 = dev.add_peer(vap, STA_MAC).unwrap();
    let slot2 = dev
        .key_set_peer(peer2, KeyMaterial::new(CipherKind::AesCcm, &[2u8; 16]))
        .unwrap();
    assert_eq!(slot2, slot);
}

#[test]
fn rekey_replaces_in_place() {
    let (dev, _vap, peer) = ap_with_station();
    let s1 = dev
        .key_set_peer(peer, KeyMaterial::new(CipherKind::Tkip, &[1u8; 16]))
        .unwrap();
    let s2 = dev
        .key_set_peer(peer, KeyMaterial::new(CipherKind::Tkip, &[2u8; 16]))
        .unwrap();
    // The old group was freed before the new allocation.
    assert_eq!(s1, s2);
    assert!(dev.with_hal(|hal| hal.key_resets().contains(&s1)));
}
