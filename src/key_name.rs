//! Canonical keyring names for the three key families.
//!
//! Names are the only identity keys have outside the keyring; changing any
//! of these formats breaks on-disk compatibility with existing deployments.

/// Prefix of master key names.
pub const MASTER_KEY_PREFIX: &str = "INNODBKey";

/// Prefix of per-tablespace system key names.
pub const PERCONA_SYSTEM_KEY_PREFIX: &str = "percona_innodb";

/// Prefix of redo-log system key names.
pub const REDO_KEY_PREFIX: &str = "percona_redo";

/// Upper bound on the length of any generated key name.
pub const MASTER_KEY_NAME_MAX_LEN: usize = 80;

/// Length of a server uuid string.
pub const SERVER_UUID_LEN: usize = 36;

fn checked(name: String) -> String {
    debug_assert!(name.len() <= MASTER_KEY_NAME_MAX_LEN);
    debug_assert!(name.is_ascii());
    name
}

/// Name of a master key: `INNODBKey-<server_uuid>-<id>`.
///
/// The uuid must be non-empty; every key stored for this instance is scoped
/// by it.
pub fn master_key_name(server_uuid: &str, master_key_id: u32) -> String {
    debug_assert!(!server_uuid.is_empty());
    checked(format!("{MASTER_KEY_PREFIX}-{server_uuid}-{master_key_id}"))
}

/// Name of a master key stored by servers predating uuid scoping:
/// `INNODBKey-<server_id>-<id>`.
pub fn legacy_master_key_name(server_id: u32, master_key_id: u32) -> String {
    checked(format!("{MASTER_KEY_PREFIX}-{server_id}-{master_key_id}"))
}

/// Name of a system key: `percona_innodb-<key_id>-<uuid>`.
pub fn system_key_name(key_id: u32, uuid: &str) -> String {
    debug_assert!(!uuid.is_empty());
    checked(format!("{PERCONA_SYSTEM_KEY_PREFIX}-{key_id}-{uuid}"))
}

/// Name of one version of a system key:
/// `percona_innodb-<key_id>-<uuid>:<version>`.
pub fn versioned_system_key_name(key_id: u32, uuid: &str, version: u32) -> String {
    debug_assert!(!uuid.is_empty());
    checked(format!(
        "{PERCONA_SYSTEM_KEY_PREFIX}-{key_id}-{uuid}:{version}"
    ))
}

/// Name of the redo-log system key: `percona_redo-<uuid>`.
pub fn redo_key_name(uuid: &str) -> String {
    debug_assert!(!uuid.is_empty());
    checked(format!("{REDO_KEY_PREFIX}-{uuid}"))
}

/// Name of one version of the redo-log system key:
/// `percona_redo-<uuid>:<version>`.
pub fn versioned_redo_key_name(uuid: &str, version: u32) -> String {
    debug_assert!(!uuid.is_empty());
    checked(format!("{REDO_KEY_PREFIX}-{uuid}:{version}"))
}

/// Whether the name belongs to one of the versioned system key families.
pub fn is_system_key_name(name: &str) -> bool {
    let rest = name
        .strip_prefix(PERCONA_SYSTEM_KEY_PREFIX)
        .or_else(|| name.strip_prefix(REDO_KEY_PREFIX));
    matches!(rest, Some(rest) if rest.starts_with('-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_key_names() {
        let uuid = "00000000-0000-0000-0000-000000000001";
        assert_eq!(
            master_key_name(uuid, 1),
            "INNODBKey-00000000-0000-0000-0000-000000000001-1"
        );
        assert_eq!(legacy_master_key_name(12345, 7), "INNODBKey-12345-7");
    }

    #[test]
    fn test_system_key_names() {
        let uuid = "00000000-0000-0000-0000-000000000001";
        assert_eq!(
            system_key_name(0, uuid),
            "percona_innodb-0-00000000-0000-0000-0000-000000000001"
        );
        assert_eq!(
            versioned_system_key_name(0, uuid, 4),
            "percona_innodb-0-00000000-0000-0000-0000-000000000001:4"
        );
        assert_eq!(
            versioned_redo_key_name(uuid, 2),
            "percona_redo-00000000-0000-0000-0000-000000000001:2"
        );
    }

    #[test]
    fn test_names_within_bound() {
        let uuid = "00000000-0000-0000-0000-000000000001";
        for name in [
            master_key_name(uuid, u32::MAX),
            legacy_master_key_name(u32::MAX, u32::MAX),
            versioned_system_key_name(u32::MAX, uuid, u32::MAX),
            versioned_redo_key_name(uuid, u32::MAX),
        ] {
            assert!(name.len() <= MASTER_KEY_NAME_MAX_LEN, "{name}");
        }
    }

    #[test]
    fn test_system_key_name_detection() {
        assert!(is_system_key_name("percona_innodb-0-uuid"));
        assert!(is_system_key_name("percona_redo-uuid"));
        assert!(!is_system_key_name("percona_innodbx"));
        assert!(!is_system_key_name("percona_keyring_test"));
        assert!(!is_system_key_name("INNODBKey-uuid-1"));
    }
}
