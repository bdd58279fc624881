//! Identity token properties across the public API.

use swarm::core::identity::{MAX_SUBORDINATES, MAX_UID, Role, decode, encode, validate_child};
use swarm::error::IdentityError;

#[test]
fn every_valid_position_round_trips() {
    for role in Role::ALL {
        for (subs, rank, uid) in [(0, 1, 1), (MAX_SUBORDINATES, 42, MAX_UID), (7, 3, 12_345)] {
            let token = encode(role.code(), subs, rank, uid).expect("encode");
            let identity = decode(&token).expect("decode");
            assert_eq!(identity.role, role);
            assert_eq!(
                (identity.subordinate_count, identity.sibling_rank, identity.uid),
                (subs, rank, uid)
            );
            assert_eq!(identity.token(), token);
        }
    }
}

#[test]
fn out_of_range_fields_are_rejected() {
    assert!(matches!(
        encode("DEV", MAX_SUBORDINATES + 1, 1, 1),
        Err(IdentityError::SubordinatesOutOfRange { .. })
    ));
    assert!(matches!(
        encode("DEV", 0, 0, 1),
        Err(IdentityError::InvalidSiblingRank(0))
    ));
    assert!(matches!(
        encode("DEV", 0, 1, MAX_UID + 1),
        Err(IdentityError::UidOutOfRange { .. })
    ));
    assert!(matches!(encode("INTERN", 0, 1, 1), Err(IdentityError::UnknownRole(_))));
}

#[test]
fn root_without_subordinates_cannot_take_children() {
    let ceo = decode("HIVE_CEO_W0_S1_U00001").expect("decode");
    assert_eq!(ceo.role, Role::Ceo);
    assert_eq!(ceo.depth(), 0);
    assert_eq!(ceo.subordinate_count, 0);
    assert!(validate_child(&ceo, Role::Cto).is_err());
}

#[test]
fn layer_skipping_children_are_rejected() {
    let ceo = decode("HIVE_CEO_W2_S1_U00001").expect("decode");
    assert!(validate_child(&ceo, Role::Cto).is_ok());
    assert!(validate_child(&ceo, Role::Dev).is_err());
    let dev = decode("HIVE_DEV_W0_S1_U00004").expect("decode");
    assert!(validate_child(&dev, Role::Qa).is_err());
}
