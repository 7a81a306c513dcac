//! 配置模块，负责从JSON文件加载过滤器目录

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{FilterError, Result};
use crate::filter::Filter;
use crate::sql_compiler::CompilerConfig;

/// 目录配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置文件不存在: {}", .0.display())]
    Missing(PathBuf),

    #[error("无法读取配置文件 {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("无法解析JSON配置 {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// 过滤器目录: 配置单元名到过滤器定义的映射, 以及 info area 到数据库表名的映射
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterCatalog {
    /// 单元名 -> `[tableDefinition, displayName?]`
    pub filters: BTreeMap<String, Value>,
    /// info area id -> 表名
    pub table_mapping: HashMap<String, String>,
}

impl FilterCatalog {
    /// 从JSON文件加载目录
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(ConfigError::Missing(path_ref.to_path_buf()));
        }

        let content = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;

        Self::parse(&content, path_ref)
    }

    pub fn from_json_str(content: &str) -> std::result::Result<Self, ConfigError> {
        Self::parse(content, Path::new("<inline>"))
    }

    fn parse(content: &str, path: &Path) -> std::result::Result<Self, ConfigError> {
        let catalog: FilterCatalog =
            serde_json::from_str(content).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(
            "catalog {} holds {} filter units",
            path.display(),
            catalog.filters.len()
        );
        Ok(catalog)
    }

    /// 所有单元名 (有序)
    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// 将一个配置单元转换为过滤器, 定义有误时立即失败
    pub fn filter(&self, unit_name: &str) -> Result<Filter> {
        let definition = self
            .filters
            .get(unit_name)
            .ok_or_else(|| FilterError::UnknownUnit(unit_name.to_string()))?;
        Filter::from_definition(unit_name, definition)
    }

    /// 转换所有配置单元
    pub fn filters(&self) -> Result<Vec<Filter>> {
        self.unit_names().map(|name| self.filter(name)).collect()
    }

    /// 使用目录中的表映射创建编译器配置
    pub fn compiler_config(&self) -> CompilerConfig {
        CompilerConfig {
            table_mapping: self.table_mapping.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CATALOG: &str = r#"{
        "filters": {
            "KD.Active": [["KD", -1, "", ["LEAF", 5, "=", null, ["1"]]], "Active companies"],
            "KP.Status": [["KP", -1, "", ["LEAF", 2, "=", null, ["$parStatus"]]]]
        },
        "tableMapping": { "KD": "company", "KP": "person" }
    }"#;

    #[test]
    fn test_load_valid_json_config() {
        // 创建临时配置文件
        let temp_file = std::env::temp_dir().join("crm_filter_catalog_valid.json");
        let mut file = fs::File::create(&temp_file).unwrap();
        writeln!(file, "{}", CATALOG).unwrap();

        let catalog = FilterCatalog::from_json_file(&temp_file).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.unit_names().collect::<Vec<_>>(), vec!["KD.Active", "KP.Status"]);
        assert_eq!(catalog.table_mapping["KD"], "company");

        let filter = catalog.filter("KD.Active").unwrap();
        assert_eq!(filter.display_name(), "Active companies");
        assert_eq!(catalog.filters().unwrap().len(), 2);
        assert_eq!(catalog.compiler_config().table_mapping.len(), 2);

        // 清理
        fs::remove_file(&temp_file).ok();
    }

    #[test]
    fn test_unknown_unit() {
        let catalog = FilterCatalog::from_json_str(CATALOG).unwrap();
        assert_eq!(
            catalog.filter("FI.Missing"),
            Err(FilterError::UnknownUnit("FI.Missing".to_string()))
        );
    }

    #[test]
    fn test_malformed_unit_fails_on_conversion() {
        let catalog = FilterCatalog::from_json_str(
            r#"{ "filters": { "KD.Broken": [["KD", -1, "", ["LEAF", 5, "=", null, []]]] } }"#,
        )
        .unwrap();
        assert!(catalog.table_mapping.is_empty());
        assert!(matches!(
            catalog.filter("KD.Broken"),
            Err(FilterError::Malformed { .. })
        ));
        assert!(catalog.filters().is_err());
    }

    #[test]
    fn test_invalid_json_config() {
        let result = FilterCatalog::from_json_str("invalid json");
        assert!(matches!(result, Err(ConfigError::Json { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = FilterCatalog::from_json_file("non_existent_file.json");
        assert!(matches!(result, Err(ConfigError::Missing(_))));
    }
}
