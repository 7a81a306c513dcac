use anyhow::{bail, Context, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crm_filter::config::FilterCatalog;
use crm_filter::sql_compiler::SqlCompiler;
use crm_filter::{Filter, FilterCheckResult, ValueDictionary};

const HELP: &str = "\
命令:
  list                       列出所有过滤器
  show <unit>                显示过滤器的表树
  params <unit>              显示过滤器的参数
  set <name> <value...>      设置参数值 (例如 set parStatus ACTIVE)
  clear                      清除所有参数值
  check <unit> <value>       用当前参数值校验一个值
  sql <unit>                 编译为 SQL
  merge <unitA> <unitB> [and] 合并两个过滤器 (默认 OR)
  help | quit";

/// 交互式会话: 目录、编译器和当前设置的参数值
struct Shell {
    catalog: FilterCatalog,
    compiler: SqlCompiler,
    values: ValueDictionary,
}

impl Shell {
    fn execute(&mut self, line: &str) -> Result<()> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["help"] => println!("{}", HELP),
            ["list"] => self.list(),
            ["show", unit] => print!("{}", self.catalog.filter(unit)?),
            ["params", unit] => self.params(unit)?,
            ["set", name, values @ ..] if !values.is_empty() => {
                self.values.insert(name, values.iter().copied());
                println!("✓ {} = {:?}", name, values);
            }
            ["clear"] => {
                self.values = ValueDictionary::new();
                println!("✓ 已清除所有参数值");
            }
            ["check", unit, value] => self.check(unit, value)?,
            ["sql", unit] => self.sql(unit)?,
            ["merge", left, right] => self.merge(left, right, true)?,
            ["merge", left, right, "and"] => self.merge(left, right, false)?,
            _ => bail!("无法识别的命令: {} (输入 help 查看帮助)", line),
        }
        Ok(())
    }

    fn list(&self) {
        for name in self.catalog.unit_names() {
            match self.catalog.filter(name) {
                Ok(filter) => println!("  {} [{}] {}", name, filter.info_area_id(), filter.display_name()),
                Err(e) => println!("  {} ✗ {}", name, e),
            }
        }
    }

    fn params(&self, unit: &str) -> Result<()> {
        let filter = self.catalog.filter(unit)?;
        let Some(parameters) = filter.parameters() else {
            println!("{} 没有参数", unit);
            return Ok(());
        };
        for name in parameters.names() {
            let references = parameters.named(name);
            let tables: Vec<String> = references.iter().map(|p| p.table().key()).collect();
            println!("  {} ({} 处引用, 表: {})", name, references.len(), tables.join(", "));
        }
        let unnamed = parameters.unnamed();
        if !unnamed.is_empty() {
            println!("  {} 个未命名参数", unnamed.len());
        }
        Ok(())
    }

    /// 套用当前参数值; 根表被删除时报错
    fn bound_filter(&self, unit: &str) -> Result<Filter> {
        let filter = self.catalog.filter(unit)?;
        match filter.apply_value_dictionary(&self.values) {
            Some(bound) => Ok(bound),
            None => bail!("过滤器 {} 在当前参数下被整体移除", unit),
        }
    }

    fn check(&self, unit: &str, value: &str) -> Result<()> {
        let filter = self.bound_filter(unit)?;
        match filter.check_value(value) {
            None => println!("✓ '{}' 满足 {}", value, unit),
            Some(result) => print_failure(&result, 0),
        }
        Ok(())
    }

    fn sql(&self, unit: &str) -> Result<()> {
        let filter = self.bound_filter(unit)?;
        let result = self
            .compiler
            .compile(&filter)
            .with_context(|| format!("无法编译过滤器 {}", unit))?;
        println!("{}", result.sql);
        if !result.optimizations.is_empty() {
            println!("\n[应用的优化]:");
            for opt in &result.optimizations {
                println!("• {:?}", opt);
            }
        }
        Ok(())
    }

    fn merge(&self, left: &str, right: &str, or_relation: bool) -> Result<()> {
        let left = self.catalog.filter(left)?;
        let right = self.catalog.filter(right)?;
        let merged = if or_relation {
            left.append_or_filter(&right)
        } else {
            left.append_and_filter(&right)
        };
        print!("{}", merged);
        Ok(())
    }
}

fn print_failure(result: &FilterCheckResult, depth: usize) {
    let indent = "  ".repeat(depth);
    match result.error_key() {
        Some(key) => println!("{}✗ {} ({})", indent, result.failing_condition(), key),
        None => println!("{}✗ {}", indent, result.failing_condition()),
    }
    for child in result.child_results() {
        print_failure(child, depth + 1);
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "filters.json".to_string());
    let catalog = FilterCatalog::from_json_file(&path)
        .with_context(|| format!("无法加载过滤器目录 {}", path))?;

    println!("--- CRM Filter: 过滤器目录 ---");
    println!("✅ 从 {} 加载了 {} 个过滤器", path, catalog.len());
    println!("{}", HELP);

    let compiler = SqlCompiler::from_config(catalog.compiler_config());
    let mut shell = Shell {
        catalog,
        compiler,
        values: ValueDictionary::new(),
    };

    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline("filter> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                if matches!(line, "quit" | "exit") {
                    break;
                }
                if let Err(e) = shell.execute(line) {
                    println!("✗ {:#}", e);
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
