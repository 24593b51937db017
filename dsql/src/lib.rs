//! DSQL - Document SQL
//!
//! A SQL dialect for querying document collections, with escape hatches
//! into the store's native query language.
//!
//! # Syntax Overview
//!
//! ```dsql
//! -- Projection, filtering and paging
//! SELECT name, age FROM users WHERE age > 30 ORDER BY age DESC LIMIT 10;
//!
//! -- Nested fields use dotted paths
//! SELECT address.city, COUNT(*) AS n FROM users GROUP BY address.city HAVING COUNT(*) > 1;
//!
//! -- Joins
//! SELECT u.name, o.total FROM users u LEFT JOIN orders o ON o.user_id = u._id;
//!
//! -- Native fragments are passed through to the script bridge
//! SELECT * FROM users WHERE $${ _id: ObjectId("64b000000000000000000001") }$$;
//!
//! -- Parameters: positional and named
//! SELECT * FROM users WHERE age > ? AND name LIKE :prefix;
//!
//! -- Writes
//! INSERT INTO users (name, age) VALUES ('Ada', 36);
//! UPDATE users SET active = false WHERE age < 18;
//! DELETE FROM users WHERE name = 'Ada';
//!
//! -- Shell-form commands
//! db.users.find({ age: { $gt: 30 } }).sort({ age: -1 }).limit(5);
//! ```
//!
//! # Special Features
//!
//! - `$$ ... $$` - Native fragment; `$$` inside quoted strings does not close it
//! - `?` - Positional parameters, numbered from 1 in textual order
//! - `:name` - Named parameters
//! - `DATE 'YYYY-MM-DD'` / `TIMESTAMP '...'` - Typed date literals (UTC)

mod ast;
mod error;
mod parser;

pub use ast::*;
pub use error::SyntaxError;

/// Parse a DSQL statement into an AST
pub fn parse(input: &str) -> Result<Statement, SyntaxError> {
    parser::parse_statement(input)
}

/// Parse multiple DSQL statements (separated by semicolons)
pub fn parse_multi(input: &str) -> Result<Vec<Statement>, SyntaxError> {
    parser::parse_statements(input)
}

/// Parse a timestamp string the same way `TIMESTAMP '...'` literals are parsed
pub fn parse_timestamp(text: &str) -> Option<i64> {
    parser::parse_timestamp(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_select() {
        let stmt = parse("SELECT * FROM users").unwrap();
        assert!(matches!(stmt, Statement::Select(_)));
    }

    #[test]
    fn test_parse_select_with_where() {
        let stmt = parse("SELECT name, active FROM users WHERE active = false").unwrap();
        if let Statement::Select(select) = stmt {
            assert_eq!(select.from.name, "users");
            assert!(select.where_clause.is_some());
        } else {
            panic!("Expected Select statement");
        }
    }

    #[test]
    fn test_parse_insert() {
        let stmt = parse("INSERT INTO users (name, age) VALUES ('Ada', 36)").unwrap();
        assert!(matches!(stmt, Statement::Insert(_)));
    }

    #[test]
    fn test_parse_update() {
        let stmt = parse("UPDATE users SET active = true WHERE name = 'Ada'").unwrap();
        assert!(matches!(stmt, Statement::Update(_)));
    }

    #[test]
    fn test_parse_delete() {
        let stmt = parse("DELETE FROM users WHERE active = false").unwrap();
        assert!(matches!(stmt, Statement::Delete(_)));
    }

    #[test]
    fn test_parse_native_command() {
        let stmt = parse("db.users.countDocuments({ active: true })").unwrap();
        assert!(matches!(stmt, Statement::Native(ref c) if c.method == "countDocuments"));
    }

    #[test]
    fn test_reserved_collection_in_shell_command() {
        let stmt = parse("db.order.update({}, { $set: { x: 1 } })").unwrap();
        if let Statement::Native(cmd) = stmt {
            assert_eq!(cmd.collection, "order");
            assert_eq!(cmd.method, "update");
        } else {
            panic!("Expected Native statement");
        }
    }

    #[test]
    fn test_positional_parameter_count() {
        let stmt = parse("SELECT * FROM t WHERE a = ? AND b = ? LIMIT ?").unwrap();
        assert_eq!(stmt.positional_parameter_count(), 3);
    }

    #[test]
    fn test_labels_render_expressions() {
        let stmt = parse("SELECT COUNT(DISTINCT city), a + 1 FROM users").unwrap();
        let Statement::Select(select) = stmt else { panic!("Expected Select statement") };
        let labels: Vec<String> = select
            .columns
            .iter()
            .map(|c| match c {
                SelectItem::Expr { expr, .. } => expr.to_string(),
                SelectItem::Star => "*".to_string(),
            })
            .collect();
        assert_eq!(labels, vec!["COUNT(DISTINCT city)", "a + 1"]);
    }

    #[test]
    fn test_ast_serializes() {
        let stmt = parse("SELECT name FROM users WHERE age >= 21").unwrap();
        let json = serde_json::to_string(&stmt).unwrap();
        let back: Statement = serde_json::from_str(&json).unwrap();
        assert_eq!(stmt, back);
    }
}
