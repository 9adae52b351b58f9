use sparchive::domain::{DatasetId, FileNode, LibraryEntry, Manifest, UNTITLED};

#[test]
fn dataset_ids_compare_as_normalized_strings() {
    let number: DatasetId = serde_json::from_value(serde_json::json!(42)).unwrap();
    let text: DatasetId = "42".parse().unwrap();
    assert_eq!(number, text);
    assert_eq!(DatasetId::from(42), text);
    assert_eq!(serde_json::to_value(&text).unwrap(), serde_json::json!("42"));
}

#[test]
fn library_entry_from_manifest_defaults_title() {
    let manifest: Manifest = serde_json::from_str(
        r#"{"dataset_id": 5, "dataset_title": "", "thumbnail": "thumb.png", "file_tree": []}"#,
    )
    .unwrap();
    let entry = LibraryEntry::from_manifest(&manifest, "/lib/5.sparc".into());
    assert_eq!(entry.id.as_str(), "5");
    assert_eq!(entry.title, UNTITLED);
    assert_eq!(entry.thumbnail.as_deref(), Some("thumb.png"));
    assert_eq!(entry.authors, None);
}

#[test]
fn file_nodes_serialize_with_type_tag() {
    let node = FileNode::Folder {
        name: "primary".to_string(),
        children: vec![FileNode::File {
            name: "a.csv".to_string(),
            size: 3,
        }],
    };
    assert_eq!(
        serde_json::to_value(&node).unwrap(),
        serde_json::json!({
            "type": "folder",
            "name": "primary",
            "children": [{"type": "file", "name": "a.csv", "size": 3}]
        })
    );
}
