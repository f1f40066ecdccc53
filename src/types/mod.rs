use std::collections::HashMap;
use std::path::PathBuf;

use aws_smithy_types::byte_stream::ByteStream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod token;

/// ACL sentinel that means "read the ACL from the source object and apply it
/// verbatim on the target" instead of a canned ACL name.
pub const ACL_COPY_SENTINEL: &str = "copy";

/// The unit of work flowing through the pipeline.
///
/// An `Object` is created by the list stage, enriched by the load stages and
/// consumed by the upload stage. After a successful content read exactly one
/// of `content` / `content_stream` is populated; whoever consumes the stream
/// owns it and must drain it.
#[derive(Debug, Default)]
pub struct Object {
    pub key: String,
    pub version_id: Option<String>,
    pub is_latest: Option<bool>,
    pub content: Option<Vec<u8>>,
    pub content_stream: Option<ByteStream>,
    pub content_length: Option<i64>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub cache_control: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    pub acl: Option<String>,
    pub access_control_policy: Option<AccessControlPolicy>,
    pub storage_class: Option<String>,
    pub e_tag: Option<String>,
    pub mtime: Option<DateTime<Utc>>,
}

impl Object {
    pub fn with_key(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Default::default()
        }
    }

    /// Byte count of the loaded body, from whichever field knows it.
    pub fn size(&self) -> i64 {
        if let Some(content_length) = self.content_length {
            return content_length;
        }

        self.content.as_ref().map_or(0, |content| content.len() as i64)
    }
}

/// Explicit owner + grants, populated only when ACL copy semantics are used.
/// Kept SDK-agnostic so it can be persisted in the filesystem metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlPolicy {
    pub owner: Option<Owner>,
    pub grants: Vec<Grant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub grantee: Grantee,
    pub permission: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grantee {
    pub grantee_type: String,
    pub id: Option<String>,
    pub uri: Option<String>,
    pub email_address: Option<String>,
    pub display_name: Option<String>,
}

/// Metadata record persisted beside an object on metadata-capable local
/// storage. Field names are part of the on-disk format.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetaRecord {
    pub e_tag: Option<String>,
    pub mtime: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    pub acl: Option<String>,
    pub cache_control: Option<String>,
    pub version_id: Option<String>,
    pub access_control_policy: Option<AccessControlPolicy>,
}

impl ObjectMetaRecord {
    pub fn from_object(object: &Object) -> Self {
        Self {
            e_tag: object.e_tag.clone(),
            mtime: object.mtime,
            content_type: object.content_type.clone(),
            content_disposition: object.content_disposition.clone(),
            content_encoding: object.content_encoding.clone(),
            content_language: object.content_language.clone(),
            metadata: object.metadata.clone(),
            acl: object.acl.clone(),
            cache_control: object.cache_control.clone(),
            version_id: object.version_id.clone(),
            access_control_policy: object.access_control_policy.clone(),
        }
    }

    pub fn apply_to(self, object: &mut Object) {
        object.e_tag = self.e_tag;
        object.mtime = self.mtime;
        object.content_type = self.content_type;
        object.content_disposition = self.content_disposition;
        object.content_encoding = self.content_encoding;
        object.content_language = self.content_language;
        object.metadata = self.metadata;
        object.acl = self.acl;
        object.cache_control = self.cache_control;
        object.version_id = self.version_id;
        object.access_control_policy = self.access_control_policy;
    }
}

/// Parsed endpoint location: which backend family plus the bucket/container
/// and key-space prefix every operation is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoragePath {
    S3 { bucket: String, prefix: String },
    S3Streaming { bucket: String, prefix: String },
    S3Versioned { bucket: String, prefix: String },
    Swift { container: String, prefix: String },
    Azure { container: String, prefix: String },
    Local(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_size_prefers_content_length() {
        let object = Object {
            key: "test".to_string(),
            content: Some(vec![0u8; 3]),
            content_length: Some(10),
            ..Default::default()
        };

        assert_eq!(object.size(), 10);
    }

    #[test]
    fn object_size_falls_back_to_content() {
        let object = Object {
            key: "test".to_string(),
            content: Some(vec![0u8; 3]),
            ..Default::default()
        };

        assert_eq!(object.size(), 3);
    }

    #[test]
    fn meta_record_round_trip() {
        let mut metadata = HashMap::new();
        metadata.insert("purpose".to_string(), "test".to_string());

        let object = Object {
            key: "dir/data1".to_string(),
            e_tag: Some("\"d41d8cd98f00b204e9800998ecf8427e\"".to_string()),
            mtime: Some(DateTime::from_timestamp(1674000000, 0).unwrap()),
            content_type: Some("text/plain".to_string()),
            content_encoding: Some("gzip".to_string()),
            metadata: Some(metadata),
            acl: Some("public-read".to_string()),
            cache_control: Some("max-age=60".to_string()),
            ..Default::default()
        };

        let json = serde_json::to_vec(&ObjectMetaRecord::from_object(&object)).unwrap();
        let record: ObjectMetaRecord = serde_json::from_slice(&json).unwrap();

        let mut restored = Object::with_key("dir/data1");
        record.apply_to(&mut restored);

        assert_eq!(restored.e_tag, object.e_tag);
        assert_eq!(restored.mtime, object.mtime);
        assert_eq!(restored.content_type, object.content_type);
        assert_eq!(restored.content_encoding, object.content_encoding);
        assert_eq!(restored.metadata, object.metadata);
        assert_eq!(restored.acl, object.acl);
        assert_eq!(restored.cache_control, object.cache_control);
    }

    #[test]
    fn meta_record_field_names_are_stable() {
        let record = ObjectMetaRecord {
            e_tag: Some("\"abc\"".to_string()),
            ..Default::default()
        };

        let json = serde_json::to_string(&record).unwrap();

        assert!(json.contains("\"e_tag\""));
        assert!(json.contains("\"mtime\""));
        assert!(json.contains("\"content_type\""));
        assert!(json.contains("\"access_control_policy\""));
    }
}
