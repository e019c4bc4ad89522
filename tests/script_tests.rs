//! Witness, locked and coinbase script behavior

use ledger_core::hash::hash256;
use ledger_core::script::{check_threshold, Script};
use ledger_core::*;

// ============================================================================
// THRESHOLDS
// ============================================================================

#[test]
fn test_threshold_without_arbitration() {
    let account = Account::new(3, 2, false).unwrap();
    assert_eq!(account.arb(), ARB_DISABLED);
    let digest = hash256(b"threshold");
    let subsets: [&[usize]; 7] = [&[0], &[1], &[2], &[0, 1], &[0, 2], &[1, 2], &[0, 1, 2]];
    for keys in subsets {
        let signer = account.retain_keys(keys);
        let result = signer.sign_witness(&digest).unwrap().verify(&digest);
        assert_eq!(result.is_ok(), keys.len() >= 2, "keys {:?}", keys);
        assert_eq!(signer.can_sign(), keys.len() >= 2);
    }
}

#[test]
fn test_arbitration_subsets() {
    let account = Account::new(4, 3, true).unwrap();
    assert_eq!(account.arb(), 3);
    let digest = hash256(b"arbitration");
    for keys in [&[3usize][..], &[0, 3], &[0, 1, 2]] {
        account.retain_keys(keys).sign_witness(&digest).unwrap().verify(&digest).unwrap();
    }
    for keys in [&[0usize][..], &[1, 2]] {
        assert!(account.retain_keys(keys).sign_witness(&digest).unwrap().verify(&digest).is_err());
    }
}

#[test]
fn test_invalid_thresholds() {
    assert!(check_threshold(0, 0, ARB_DISABLED).is_err());
    assert!(check_threshold(2, 3, ARB_DISABLED).is_err());
    assert!(check_threshold(17, 1, ARB_DISABLED).is_err());
    assert!(check_threshold(2, 1, 1).is_err());
    assert!(check_threshold(3, 3, 2).is_err());
    assert!(check_threshold(3, 2, 1).is_err());
    check_threshold(16, 16, ARB_DISABLED).unwrap();
    check_threshold(3, 1, 2).unwrap();
    assert!(Account::new(2, 1, true).is_err());
}

#[test]
fn test_signature_over_other_digest_fails() {
    let account = Account::new(2, 1, false).unwrap();
    let witness = account.sign_witness(&hash256(b"one")).unwrap();
    assert!(matches!(
        witness.verify(&hash256(b"two")),
        Err(ConsensusError::InsufficientSignatures(_))
    ));
}

// ============================================================================
// OWNERSHIP
// ============================================================================

#[test]
fn test_wrong_account_cannot_sign_spend() {
    let owner = Account::new(1, 1, false).unwrap();
    let thief = Account::new(1, 1, false).unwrap();
    let spent = TransactionOutput { value: COIN, script_pubkey: owner.locked_script(&[]).unwrap() };
    let mut tx = Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::new([4u8; 32], 0),
            script_sig: Script::default(),
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput { value: COIN, script_pubkey: thief.locked_script(&[]).unwrap() }],
        lock_time: 0,
    };
    let err = ledger_core::sign::sign_transaction(&mut tx, &[spent], &[&thief]).unwrap_err();
    assert!(matches!(err, ConsensusError::ScriptMismatch(_)));
}

#[test]
fn test_address_depends_on_shape() {
    let account = Account::new(3, 2, false).unwrap();
    let witness = account.witness_script();
    assert_eq!(witness.hash(), account.pkh());
    let mut reshaped = witness.clone();
    reshaped.less = 3;
    assert_ne!(reshaped.hash(), account.pkh());
}

#[test]
fn test_account_dump_keeps_address() {
    let account = Account::new(3, 2, true).unwrap();
    let loaded = Account::load(&account.dump().unwrap()).unwrap();
    assert_eq!(loaded.pkh(), account.pkh());
    assert!(loaded.can_sign());
}

// ============================================================================
// SCRIPT FORMS
// ============================================================================

#[test]
fn test_coinbase_script_bounds() {
    let bare = Script::coinbase(7, &[]).unwrap();
    assert_eq!(bare.len(), MIN_COINBASE_SCRIPT_SIZE);
    assert_eq!(bare.to_coinbase().unwrap().height, 7);

    let widest = Script::coinbase(7, &[0xaa; MAX_COINBASE_SCRIPT_SIZE - MIN_COINBASE_SCRIPT_SIZE - 1]).unwrap();
    assert_eq!(widest.len(), MAX_COINBASE_SCRIPT_SIZE);
    assert!(matches!(
        Script::coinbase(7, &[0xaa; MAX_COINBASE_SCRIPT_SIZE - MIN_COINBASE_SCRIPT_SIZE]),
        Err(ConsensusError::SizeLimitExceeded(_))
    ));
}

#[test]
fn test_locked_script_ext() {
    let pkh = [5u8; 20];
    let script = Script::locked(pkh, b"memo").unwrap();
    assert!(script.is_locked());
    let locked = script.to_locked().unwrap();
    assert_eq!(locked.pkh, pkh);
    assert_eq!(locked.ext, b"memo".to_vec());
    assert_eq!(script.pkh().unwrap(), pkh);

    Script::locked(pkh, &vec![0u8; MAX_EXT_SIZE]).unwrap();
    assert!(matches!(Script::locked(pkh, &vec![0u8; MAX_EXT_SIZE + 1]), Err(ConsensusError::SizeLimitExceeded(_))));
}

#[test]
fn test_script_kinds_are_distinct() {
    let account = Account::new(1, 1, false).unwrap();
    let witness = account.witness_script().to_script();
    assert!(witness.is_witness());
    assert!(matches!(witness.pkh(), Err(ConsensusError::ScriptMismatch(_))));
    assert!(matches!(witness.to_coinbase(), Err(ConsensusError::ScriptMismatch(_))));
    assert!(Script::default().script_type().is_none());
}
