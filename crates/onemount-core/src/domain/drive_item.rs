//! The serialized remote object
//!
//! `DriveItem` mirrors the wire shape of the object-metadata service
//! (camelCase JSON with facet objects) and doubles as the metadata snapshot
//! embedded in every inode. Exactly one of the folder, file, or deletion
//! facets is meaningful at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::ItemId;

/// Reference to the parent of a drive item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    /// Parent item id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ItemId>,
    /// Parent path in the drive, e.g. `/drive/root:/Documents`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Folder facet; its presence marks the item as a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    /// Number of immediate children
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_count: Option<u64>,
}

/// Content hashes reported by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hashes {
    /// QuickXorHash of the file content (Base64-encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quick_xor_hash: Option<String>,
}

/// File facet; its presence marks the item as a regular file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    /// MIME type reported by the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Content hashes for integrity verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Hashes>,
}

/// Deletion facet; its presence marks the item as deleted server-side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedFacet {
    /// Reason or state of deletion (often absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// A file or folder as described by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    /// Stable server id, or a `local-` placeholder before first upload
    pub id: ItemId,
    /// Item name (file or folder name)
    #[serde(default)]
    pub name: String,
    /// Reference to the parent item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_reference: Option<ParentRef>,
    /// Size in bytes (0 for folders)
    #[serde(default)]
    pub size: u64,
    /// Last modified time, millisecond granularity, UTC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    /// Version token for conditional operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e_tag: Option<String>,
    /// Present if the item is a folder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<FolderFacet>,
    /// Present if the item is a file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileFacet>,
    /// Present if the item has been deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DeletedFacet>,
    /// Conflict-behavior hint sent on create ("rename", "replace", "fail")
    #[serde(
        rename = "@microsoft.graph.conflictBehavior",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub conflict_behavior: Option<String>,
}

impl DriveItem {
    /// Builds a minimal file item, as used for locally-created inodes.
    #[must_use]
    pub fn new_file(id: ItemId, name: impl Into<String>, parent_id: ItemId) -> Self {
        Self {
            id,
            name: name.into(),
            parent_reference: Some(ParentRef {
                id: Some(parent_id),
                path: None,
            }),
            size: 0,
            last_modified_date_time: Some(Utc::now()),
            e_tag: None,
            folder: None,
            file: Some(FileFacet::default()),
            deleted: None,
            conflict_behavior: None,
        }
    }

    /// Builds a minimal folder item.
    #[must_use]
    pub fn new_folder(id: ItemId, name: impl Into<String>, parent_id: ItemId) -> Self {
        Self {
            id,
            name: name.into(),
            parent_reference: Some(ParentRef {
                id: Some(parent_id),
                path: None,
            }),
            size: 0,
            last_modified_date_time: Some(Utc::now()),
            e_tag: None,
            folder: Some(FolderFacet::default()),
            file: None,
            deleted: None,
            conflict_behavior: None,
        }
    }

    /// The synthetic root item.
    #[must_use]
    pub fn root() -> Self {
        Self {
            id: ItemId::root(),
            name: String::new(),
            parent_reference: Some(ParentRef {
                id: None,
                path: Some(String::new()),
            }),
            size: 0,
            last_modified_date_time: Some(Utc::now()),
            e_tag: None,
            folder: Some(FolderFacet::default()),
            file: None,
            deleted: None,
            conflict_behavior: None,
        }
    }

    /// Returns true if the folder facet is present.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.folder.is_some() && self.deleted.is_none()
    }

    /// Returns true if the file facet is present.
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.file.is_some() && self.deleted.is_none()
    }

    /// Returns true if the deletion facet is present.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    /// Parent id, if the service provided one.
    #[must_use]
    pub fn parent_id(&self) -> Option<&ItemId> {
        self.parent_reference.as_ref().and_then(|p| p.id.as_ref())
    }

    /// QuickXorHash from the file facet, if reported.
    #[must_use]
    pub fn quick_xor_hash(&self) -> Option<&str> {
        self.file
            .as_ref()
            .and_then(|f| f.hashes.as_ref())
            .and_then(|h| h.quick_xor_hash.as_deref())
    }

    /// Replaces the file facet's hash, creating the facet chain as needed.
    pub fn set_quick_xor_hash(&mut self, hash: impl Into<String>) {
        let facet = self.file.get_or_insert_with(FileFacet::default);
        facet.hashes.get_or_insert_with(Hashes::default).quick_xor_hash = Some(hash.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_wire_file() {
        let json = r#"{
            "id": "01BYE5RZ6QN3ZWBTUFOFD3GSPGOHDJD36K",
            "name": "document.pdf",
            "size": 1048576,
            "eTag": "aMTIzNDU2Nzg5",
            "lastModifiedDateTime": "2025-06-15T10:30:00Z",
            "parentReference": {
                "path": "/drive/root:/Documents",
                "id": "01BYE5RZ5PXRAAAAAAAAAAAAAAAA"
            },
            "file": {
                "mimeType": "application/pdf",
                "hashes": {
                    "quickXorHash": "AAAAAAAAAAAAAAAAAAAAAAAAAAA="
                }
            }
        }"#;

        let item: DriveItem = serde_json::from_str(json).unwrap();
        assert!(item.is_file());
        assert!(!item.is_dir());
        assert!(!item.is_deleted());
        assert_eq!(item.size, 1048576);
        assert_eq!(item.e_tag.as_deref(), Some("aMTIzNDU2Nzg5"));
        assert_eq!(
            item.quick_xor_hash(),
            Some("AAAAAAAAAAAAAAAAAAAAAAAAAAA=")
        );
        assert_eq!(item.parent_id().unwrap().as_str(), "01BYE5RZ5PXRAAAAAAAAAAAAAAAA");
    }

    #[test]
    fn test_deserialize_wire_folder() {
        let json = r#"{
            "id": "FOLDER123",
            "name": "My Folder",
            "folder": { "childCount": 5 },
            "parentReference": { "path": "/drive/root:", "id": "root" }
        }"#;

        let item: DriveItem = serde_json::from_str(json).unwrap();
        assert!(item.is_dir());
        assert!(!item.is_file());
        assert_eq!(item.folder.as_ref().unwrap().child_count, Some(5));
    }

    #[test]
    fn test_deserialize_deletion_marker() {
        let json = r#"{
            "id": "DELETED_ID",
            "name": "old-file.txt",
            "deleted": {}
        }"#;

        let item: DriveItem = serde_json::from_str(json).unwrap();
        assert!(item.is_deleted());
        assert!(!item.is_file());
        assert!(!item.is_dir());
    }

    #[test]
    fn test_new_file_has_local_parent_link() {
        let id = ItemId::local();
        let item = DriveItem::new_file(id.clone(), "hello.txt", ItemId::root());
        assert!(item.is_file());
        assert_eq!(item.id, id);
        assert_eq!(item.parent_id().unwrap().as_str(), "root");
        assert_eq!(item.size, 0);
        assert!(item.e_tag.is_none());
    }

    #[test]
    fn test_root_item() {
        let root = DriveItem::root();
        assert!(root.is_dir());
        assert!(root.id.is_root());
        assert_eq!(root.parent_reference.unwrap().path.unwrap(), "");
    }

    #[test]
    fn test_set_quick_xor_hash_creates_facets() {
        let mut item = DriveItem::new_file(ItemId::local(), "a", ItemId::root());
        item.file = None;
        item.set_quick_xor_hash("SGVsbG8=");
        assert_eq!(item.quick_xor_hash(), Some("SGVsbG8="));
    }

    #[test]
    fn test_serde_roundtrip() {
        let item = DriveItem::new_folder(
            ItemId::new("FOLDER1").unwrap(),
            "Photos",
            ItemId::root(),
        );
        let json = serde_json::to_string(&item).unwrap();
        let back: DriveItem = serde_json::from_str(&json).unwrap();
        assert_eq!(item, back);
    }
}
