//! SQL parsing and classification logic.
//!
//! Uses sqlparser-rs with the engine's dialect to parse SQL and classify
//! statements by their safety level. Anything the parser rejects is reported
//! as `SyntaxRejected` rather than guessed at.

use sqlparser::ast::{Query, Select, Set, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::{Dialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::db::EngineKind;
use crate::error::{CopilotError, Result};

use super::{ClassificationResult, SafetyLevel, StatementType};

/// Functions that change state even when called from a SELECT.
const SIDE_EFFECT_FUNCTIONS: &[&str] = &[
    "nextval",
    "setval",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "pg_rotate_logfile",
    "pg_advisory_lock",
    "lo_import",
    "lo_export",
    "lo_unlink",
    "dblink_exec",
    "set_config",
    "load_extension",
];

/// PRAGMAs that only read catalog information.
const READ_ONLY_PRAGMAS: &[&str] = &[
    "table_info",
    "table_xinfo",
    "table_list",
    "index_list",
    "index_info",
    "foreign_key_list",
    "database_list",
    "compile_options",
];

/// SQL classifier for one dialect.
#[derive(Debug)]
pub struct SqlClassifier {
    dialect: Box<dyn Dialect>,
}

impl Default for SqlClassifier {
    fn default() -> Self {
        Self::for_engine(EngineKind::Postgres)
    }
}

impl SqlClassifier {
    pub fn for_engine(engine: EngineKind) -> Self {
        let dialect: Box<dyn Dialect> = match engine {
            EngineKind::Sqlite => Box::new(SQLiteDialect {}),
            _ => Box::new(PostgreSqlDialect {}),
        };
        Self { dialect }
    }

    /// Classifies a SQL string.
    ///
    /// Multiple statements take the level of the most dangerous one.
    pub fn classify(&self, sql: &str) -> Result<ClassificationResult> {
        let statements = Parser::parse_sql(self.dialect.as_ref(), sql)
            .map_err(|e| CopilotError::syntax(format!("SQL parse error: {e}")))?;

        let mut results = statements.iter().map(classify_statement);
        let first = results
            .next()
            .ok_or_else(|| CopilotError::syntax("no SQL statement found"))?;

        let result = if statements.len() == 1 {
            first
        } else {
            let worst = results.fold(first, ClassificationResult::max);
            ClassificationResult::new(worst.level, StatementType::Multiple(Box::new(worst.statement_type)))
        };

        if result.level == SafetyLevel::Safe {
            if let Some(function) = self.side_effect_call(sql) {
                return Ok(ClassificationResult::new(
                    SafetyLevel::Mutating,
                    StatementType::SideEffect(function),
                ));
            }
        }
        Ok(result)
    }

    /// Finds a call to a known side-effecting function anywhere in the text.
    fn side_effect_call(&self, sql: &str) -> Option<String> {
        let tokens = Tokenizer::new(self.dialect.as_ref(), sql).tokenize().ok()?;
        let mut significant = tokens
            .iter()
            .filter(|t| !matches!(t, Token::Whitespace(_)))
            .peekable();

        while let Some(token) = significant.next() {
            if let Token::Word(word) = token {
                let name = word.value.to_lowercase();
                if word.quote_style.is_none()
                    && SIDE_EFFECT_FUNCTIONS.contains(&name.as_str())
                    && matches!(significant.peek(), Some(Token::LParen))
                {
                    return Some(name);
                }
            }
        }
        None
    }
}

fn safe(statement_type: StatementType) -> ClassificationResult {
    ClassificationResult::new(SafetyLevel::Safe, statement_type)
}

fn mutating(statement_type: StatementType) -> ClassificationResult {
    ClassificationResult::new(SafetyLevel::Mutating, statement_type)
}

fn destructive(statement_type: StatementType) -> ClassificationResult {
    ClassificationResult::new(SafetyLevel::Destructive, statement_type)
}

/// Classifies a single parsed statement.
fn classify_statement(statement: &Statement) -> ClassificationResult {
    match statement {
        // Query: may contain data-modifying CTEs, so recurse
        Statement::Query(query) => classify_query(query),
        Statement::Explain {
            analyze, statement, ..
        } => {
            // EXPLAIN ANALYZE executes the statement
            let level = if *analyze {
                classify_statement(statement).level
            } else {
                SafetyLevel::Safe
            };
            ClassificationResult::new(level, StatementType::Explain)
        }
        Statement::ExplainTable { .. } => safe(StatementType::Show),
        Statement::ShowVariable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. } => safe(StatementType::Show),
        Statement::Pragma { name, .. } => {
            let pragma = name.to_string().to_lowercase();
            let pragma = pragma.rsplit('.').next().unwrap_or_default();
            if READ_ONLY_PRAGMAS.contains(&pragma) {
                safe(StatementType::Show)
            } else {
                mutating(StatementType::Unknown)
            }
        }

        Statement::Insert(_) => mutating(StatementType::Insert),
        Statement::Update { .. } => mutating(StatementType::Update),
        Statement::Merge { .. } => mutating(StatementType::Merge),
        Statement::Set(
            Set::SingleAssignment { .. }
            | Set::ParenthesizedAssignments { .. }
            | Set::MultipleAssignments { .. },
        ) => mutating(StatementType::Unknown),

        Statement::Delete(_) => destructive(StatementType::Delete),
        Statement::Drop { .. } => destructive(StatementType::Drop),
        Statement::Truncate { .. } => destructive(StatementType::Truncate),
        Statement::AlterTable { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterView { .. }
        | Statement::AlterRole { .. } => destructive(StatementType::Alter),
        Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateProcedure { .. }
        | Statement::CreateRole { .. }
        | Statement::CreateSequence { .. }
        | Statement::CreateType { .. } => destructive(StatementType::Create),
        Statement::Grant { .. } => destructive(StatementType::Grant),
        Statement::Revoke { .. } => destructive(StatementType::Revoke),

        // Transactions, COPY, CALL and anything else are never auto-run
        _ => destructive(StatementType::Unknown),
    }
}

/// Classifies a query, including every CTE it defines.
fn classify_query(query: &Query) -> ClassificationResult {
    let body = classify_set_expr(&query.body);
    match &query.with {
        Some(with) => with
            .cte_tables
            .iter()
            .map(|cte| classify_query(&cte.query))
            .fold(body, ClassificationResult::max),
        None => body,
    }
}

fn classify_set_expr(set_expr: &SetExpr) -> ClassificationResult {
    match set_expr {
        // Data-modifying CTE bodies
        SetExpr::Delete(stmt)
        | SetExpr::Update(stmt)
        | SetExpr::Insert(stmt)
        | SetExpr::Merge(stmt) => classify_statement(stmt),
        SetExpr::Query(query) => classify_query(query),
        SetExpr::Select(select) => classify_select(select),
        SetExpr::SetOperation { left, right, .. } => {
            classify_set_expr(left).max(classify_set_expr(right))
        }
        SetExpr::Values(_) | SetExpr::Table(_) => safe(StatementType::Select),
    }
}

fn classify_select(select: &Select) -> ClassificationResult {
    // SELECT ... INTO creates a table
    if select.into.is_some() {
        return destructive(StatementType::Create);
    }
    select
        .from
        .iter()
        .map(classify_table_with_joins)
        .fold(safe(StatementType::Select), ClassificationResult::max)
}

fn classify_table_with_joins(twj: &TableWithJoins) -> ClassificationResult {
    twj.joins
        .iter()
        .map(|join| classify_table_factor(&join.relation))
        .fold(
            classify_table_factor(&twj.relation),
            ClassificationResult::max,
        )
}

fn classify_table_factor(factor: &TableFactor) -> ClassificationResult {
    match factor {
        TableFactor::Derived { subquery, .. } => classify_query(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => classify_table_with_joins(table_with_joins),
        _ => safe(StatementType::Select),
    }
}
