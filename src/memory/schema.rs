//! 持久化格式的 JSON Schema（schemars 生成），供外部工具校验 active.json / archive.json

use schemars::schema::RootSchema;
use schemars::schema_for;

use crate::memory::conversation::MemorySnapshot;
use crate::memory::persistence::{ActiveFile, ArchiveFile};

pub fn snapshot_schema() -> RootSchema {
    schema_for!(MemorySnapshot)
}

pub fn active_file_schema() -> RootSchema {
    schema_for!(ActiveFile)
}

pub fn archive_file_schema() -> RootSchema {
    schema_for!(ArchiveFile)
}

/// 三份 schema 合并为一个 JSON 文档（键为文件名）
pub fn schema_bundle_json() -> Result<String, serde_json::Error> {
    let bundle = serde_json::json!({
        "snapshot": snapshot_schema(),
        "active.json": active_file_schema(),
        "archive.json": archive_file_schema(),
    });
    serde_json::to_string_pretty(&bundle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_names_fields() {
        let json = serde_json::to_value(active_file_schema()).unwrap();
        let props = &json["properties"];
        assert!(props.get("next_seq").is_some());
        assert!(props.get("entries").is_some());

        let bundle = schema_bundle_json().unwrap();
        assert!(bundle.contains("ArchiveEntry"));
        assert!(bundle.contains("period_start"));
    }
}
