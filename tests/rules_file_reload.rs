//! Rules file loading against a live reconciler

mod common;

use common::{client_options, reconciler};
use push_secret_controller::controller::rules::RuleId;
use push_secret_controller::runtime::rules_reload::RulesFileLoader;
use push_secret_controller::runtime::watchers::ResourceIndex;
use tempfile::NamedTempFile;

const TWO_RULES: &str = r"
stores:
  - name: scratch
    spec:
      provider:
        memory: {}
rules:
  - namespace: payments
    name: db-push
    spec:
      source:
        secret:
          name: db-credentials
      destinations:
        - storeRef:
            name: scratch
  - namespace: payments
    name: admin-password
    spec:
      source:
        generator:
          password:
            length: 16
      destinations:
        - storeRef:
            name: scratch
";

const ONE_RULE: &str = r"
stores:
  - name: scratch
    spec:
      provider:
        memory: {}
rules:
  - namespace: payments
    name: db-push
    spec:
      source:
        secret:
          name: db-credentials
      destinations:
        - storeRef:
            name: scratch
";

fn rewrite(file: &NamedTempFile, content: &str) {
    std::fs::write(file.path(), content).expect("write rules file");
}

fn loader(file: &NamedTempFile) -> RulesFileLoader {
    RulesFileLoader::new(file.path().to_path_buf(), 5, client_options())
}

#[tokio::test]
async fn test_loads_stores_and_rules() {
    let r = reconciler();
    let index = ResourceIndex::default();
    let file = NamedTempFile::new().expect("temp file");
    rewrite(&file, TWO_RULES);

    let mut loader = loader(&file);
    assert!(loader.reload(&r, &index).await.expect("valid file"));

    assert!(r.store("scratch").is_some());
    assert_eq!(
        r.rule_ids(),
        vec![
            RuleId::new("payments", "admin-password"),
            RuleId::new("payments", "db-push"),
        ]
    );
    // Unchanged content is not applied again
    assert!(!loader.reload(&r, &index).await.expect("valid file"));
}

#[tokio::test]
async fn test_invalid_file_keeps_previous_rules() {
    let r = reconciler();
    let index = ResourceIndex::default();
    let file = NamedTempFile::new().expect("temp file");
    rewrite(&file, TWO_RULES);
    let mut loader = loader(&file);
    loader.reload(&r, &index).await.expect("valid file");

    let duplicate = format!(
        "{ONE_RULE}  - namespace: payments
    name: db-push
    spec:
      source:
        secret:
          name: other
      destinations:
        - storeRef:
            name: scratch
"
    );
    rewrite(&file, &duplicate);
    let err = loader.reload(&r, &index).await.expect_err("duplicate rule");
    assert!(format!("{err:#}").contains("rejected"));

    rewrite(&file, "rules: [this is not a rule");
    assert!(loader.reload(&r, &index).await.is_err());

    assert_eq!(r.rule_ids().len(), 2);
    assert!(r.store("scratch").is_some());
}

#[tokio::test]
async fn test_removed_rules_are_unloaded() {
    let r = reconciler();
    let index = ResourceIndex::default();
    let file = NamedTempFile::new().expect("temp file");
    rewrite(&file, TWO_RULES);
    let mut loader = loader(&file);
    loader.reload(&r, &index).await.expect("valid file");

    rewrite(&file, ONE_RULE);
    assert!(loader.reload(&r, &index).await.expect("valid file"));

    assert_eq!(r.rule_ids(), vec![RuleId::new("payments", "db-push")]);
}
