//! SELECT translation

use super::expr::{conjunction, conjuncts, null_if_missing, operator, Context, GroupedAggregate, Scope};
use super::{Output, OutputColumn, Pipeline, Stage, StageKind, TranslationError, Translator};
use crate::error::{Error, Result};
use crate::native::{Document, NativeValue};
use crate::store::{run_pipeline, Vars};
use crate::types::Cell;
use crate::validation::validate_collection_name;
use dsql::{AggregateFunc, Expr, Join, JoinKind, Literal, OrderDirection, SelectItem, SelectStmt};

fn translation(node: impl Into<String>, reason: impl Into<String>) -> Error {
    Error::from(TranslationError::new(node, reason))
}

/// Numbers and booleans in `$project` mean inclusion, so computed ones are wrapped
fn projected(value: NativeValue) -> NativeValue {
    match value {
        NativeValue::Bool(_)
        | NativeValue::Int32(_)
        | NativeValue::Int64(_)
        | NativeValue::Double(_)
        | NativeValue::Decimal128(_) => {
            let mut doc = Document::with_capacity(1);
            doc.insert("$literal", value);
            NativeValue::Document(doc)
        }
        other => other,
    }
}

fn is_simple_key(key: &str) -> bool {
    !key.is_empty() && !key.contains('.') && !key.starts_with('$')
}

fn direction(order: OrderDirection) -> NativeValue {
    match order {
        OrderDirection::Asc => NativeValue::Int32(1),
        OrderDirection::Desc => NativeValue::Int32(-1),
    }
}

/// Value an accumulator reports when the group saw no documents
fn empty_accumulator(func: AggregateFunc, distinct: bool) -> NativeValue {
    match (func, distinct) {
        (AggregateFunc::Count, true) => NativeValue::Array(Vec::new()),
        (AggregateFunc::Count, false) => NativeValue::Int32(0),
        _ => NativeValue::Null,
    }
}

impl Translator<'_> {
    pub(super) fn translate_select(&self, select: &SelectStmt) -> Result<Pipeline> {
        validate_collection_name(&select.from.name)?;
        for join in &select.joins {
            validate_collection_name(&join.table.name)?;
        }
        let ctx = Context::new(&select.from, &select.joins);
        let mut stages = Vec::new();

        // Conditions on the base collection run before the lookups
        let (base, joined): (Vec<&Expr>, Vec<&Expr>) = match &select.where_clause {
            Some(condition) => conjuncts(condition).into_iter().partition(|c| !ctx.references_join(c)),
            None => (Vec::new(), Vec::new()),
        };
        if let Some(condition) = conjunction(base) {
            stages.push(Stage::new(StageKind::Match, self.filter(&condition, &ctx)?));
        }
        for join in &select.joins {
            stages.extend(self.join_stages(join, &ctx)?);
        }
        if let Some(condition) = conjunction(joined) {
            stages.push(Stage::new(StageKind::Match, self.filter(&condition, &ctx)?));
        }

        if select.is_star() {
            if select.columns.len() > 1 {
                return Err(translation("*", "* cannot be combined with other select items"));
            }
            return self.star_select(select, &ctx, stages);
        }

        let items: Vec<(&Expr, Option<&String>)> = select
            .columns
            .iter()
            .filter_map(|item| match item {
                SelectItem::Expr { expr, alias } => Some((expr, alias.as_ref())),
                SelectItem::Star => None,
            })
            .collect();

        let has_aggregate = items.iter().any(|(e, _)| e.contains_aggregate())
            || select.order_by.iter().any(|o| o.expr.contains_aggregate());
        let grouped = !select.group_by.is_empty()
            || has_aggregate
            || select.having.is_some()
            || select.distinct;

        if grouped {
            self.grouped_select(select, &items, &ctx, stages)
        } else {
            self.projected_select(select, &items, &ctx, stages, &mut Scope::Row)
        }
    }

    fn join_stages(&self, join: &Join, ctx: &Context) -> Result<[Stage; 2]> {
        let binding = join.table.binding();
        if join.on.contains_aggregate() {
            return Err(translation(join.on.to_string(), "aggregates are not allowed in ON"));
        }
        let mut scope = Scope::Join {
            binding,
            lets: Vec::new(),
        };
        let on = self.aggregate_expr(&join.on, ctx, &mut scope)?;
        let lets = match scope {
            Scope::Join { lets, .. } => lets,
            _ => Vec::new(),
        };

        let variables: Document = lets
            .into_iter()
            .map(|(name, path)| (name, NativeValue::String(format!("${}", path))))
            .collect();
        let mut condition = Document::with_capacity(1);
        condition.insert("$expr", on);
        let mut matcher = Document::with_capacity(1);
        matcher.insert("$match", condition);

        let mut lookup = Document::with_capacity(4);
        lookup.insert("from", join.table.name.as_str());
        lookup.insert("let", variables);
        lookup.insert("pipeline", vec![NativeValue::Document(matcher)]);
        lookup.insert("as", binding);

        let mut unwind = Document::with_capacity(2);
        unwind.insert("path", format!("${}", binding));
        unwind.insert("preserveNullAndEmptyArrays", join.kind == JoinKind::Left);

        Ok([Stage::new(StageKind::Lookup, lookup), Stage::new(StageKind::Unwind, unwind)])
    }

    /// `SELECT *`: documents pass through, columns are found by the cursor
    fn star_select(&self, select: &SelectStmt, ctx: &Context, mut stages: Vec<Stage>) -> Result<Pipeline> {
        if !select.group_by.is_empty() || select.having.is_some() {
            return Err(translation("*", "SELECT * cannot be combined with GROUP BY or HAVING"));
        }
        if select.distinct {
            let mut group = Document::with_capacity(1);
            group.insert("_id", "$$ROOT");
            let mut root = Document::with_capacity(1);
            root.insert("newRoot", "$_id");
            stages.push(Stage::new(StageKind::Group, group));
            stages.push(Stage::new(StageKind::ReplaceRoot, root));
        }

        let mut computed = Document::new();
        let mut sort = Document::new();
        for (i, order) in select.order_by.iter().enumerate() {
            match &order.expr {
                Expr::Column(column) => sort.insert(ctx.resolve(column), direction(order.direction)),
                Expr::Literal(Literal::Int(_)) => {
                    return Err(translation(
                        order.expr.to_string(),
                        "ORDER BY position needs an explicit select list",
                    ))
                }
                expr if expr.contains_aggregate() => {
                    return Err(translation(expr.to_string(), "aggregates need GROUP BY"))
                }
                expr => {
                    let key = format!("_s{}", i);
                    computed.insert(key.as_str(), self.aggregate_expr(expr, ctx, &mut Scope::Row)?);
                    sort.insert(key, direction(order.direction));
                }
            }
        }

        let hidden: Vec<NativeValue> = computed.keys().map(NativeValue::from).collect();
        if !computed.is_empty() {
            stages.push(Stage::new(StageKind::AddFields, computed));
        }
        if !sort.is_empty() {
            stages.push(Stage::new(StageKind::Sort, sort));
        }
        stages.extend(self.paging(select)?);
        if !hidden.is_empty() {
            stages.push(Stage::new(StageKind::Unset, hidden));
        }

        Ok(Pipeline {
            collection: select.from.name.clone(),
            stages,
            output: Output::Fields,
            default_row: None,
        })
    }

    fn grouped_select(
        &self,
        select: &SelectStmt,
        items: &[(&Expr, Option<&String>)],
        ctx: &Context,
        mut stages: Vec<Stage>,
    ) -> Result<Pipeline> {
        let keys: Vec<Expr> = if !select.group_by.is_empty() {
            if select.distinct {
                return Err(translation("DISTINCT", "DISTINCT cannot be combined with GROUP BY"));
            }
            select.group_by.clone()
        } else if select.distinct {
            items.iter().map(|(e, _)| (*e).clone()).collect()
        } else {
            Vec::new()
        };

        // Every distinct aggregate call becomes one accumulator
        let mut calls: Vec<Expr> = Vec::new();
        let sources = items
            .iter()
            .map(|(e, _)| *e)
            .chain(select.having.iter())
            .chain(select.order_by.iter().map(|o| &o.expr));
        for expr in sources {
            let mut nested = None;
            expr.walk(&mut |e| {
                if let Expr::Aggregate { arg: Some(arg), .. } = e {
                    if arg.contains_aggregate() {
                        nested = Some(e.to_string());
                    }
                }
                if matches!(e, Expr::Aggregate { .. }) && !calls.contains(e) {
                    calls.push(e.clone());
                }
            });
            if let Some(node) = nested {
                return Err(translation(node, "aggregate calls cannot be nested"));
            }
        }

        let mut id = Document::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            if key.contains_aggregate() {
                return Err(translation(key.to_string(), "aggregates are not allowed in GROUP BY"));
            }
            id.insert(format!("g{}", i), self.aggregate_expr(key, ctx, &mut Scope::Row)?);
        }

        let mut group = Document::with_capacity(calls.len() + 1);
        group.insert("_id", if keys.is_empty() { NativeValue::Null } else { NativeValue::Document(id) });
        let mut aggregates = Vec::with_capacity(calls.len());
        let mut empty = Document::with_capacity(calls.len() + 1);
        empty.insert("_id", NativeValue::Null);
        for (j, call) in calls.into_iter().enumerate() {
            let name = format!("a{}", j);
            let (accumulator, reference, zero) = self.accumulator(&call, &name, ctx)?;
            group.insert(name.as_str(), accumulator);
            empty.insert(name, zero);
            aggregates.push(GroupedAggregate { expr: call, reference });
        }
        stages.push(Stage::new(StageKind::Group, group));
        let grouped_from = stages.len();

        let mut scope = Scope::Grouped {
            keys: &keys,
            aggregates: &aggregates,
        };
        if let Some(having) = &select.having {
            let mut condition = Document::with_capacity(1);
            condition.insert("$expr", self.aggregate_expr(having, ctx, &mut scope)?);
            stages.push(Stage::new(StageKind::Match, condition));
        }

        // Without GROUP BY, aggregates over no documents still produce one row
        let default_row = keys.is_empty().then_some(empty);
        let mut pipeline = self.projected_select(select, items, ctx, stages, &mut scope)?;
        if let Some(empty) = default_row {
            let after_group: Vec<Document> =
                pipeline.stages[grouped_from..].iter().map(Stage::to_document).collect();
            let rows = run_pipeline(&after_group, vec![empty], &|_| Vec::new(), &Vars::new())?;
            pipeline.default_row = rows.into_iter().next();
        }
        Ok(pipeline)
    }

    /// `$group` accumulator for an aggregate call, the expression reading its
    /// result, and its value over an empty input
    fn accumulator(&self, call: &Expr, name: &str, ctx: &Context) -> Result<(Document, NativeValue, NativeValue)> {
        let Expr::Aggregate { func, arg, distinct } = call else {
            return Err(translation(call.to_string(), "not an aggregate"));
        };
        let value = match arg {
            Some(arg) => Some(self.aggregate_expr(arg, ctx, &mut Scope::Row)?),
            None => None,
        };
        let reference = NativeValue::String(format!("${}", name));
        let mut accumulator = Document::with_capacity(1);

        match (func, value, distinct) {
            (AggregateFunc::Count, None, _) => accumulator.insert("$sum", NativeValue::Int32(1)),
            (AggregateFunc::Count, Some(value), true) => {
                accumulator.insert("$addToSet", operator("$ifNull", vec![value, "$$REMOVE".into()]));
                let mut size = Document::with_capacity(1);
                size.insert("$size", reference);
                return Ok((accumulator, NativeValue::Document(size), empty_accumulator(*func, true)));
            }
            (AggregateFunc::Count, Some(value), false) => {
                let is_null = operator("$eq", vec![null_if_missing(value), NativeValue::Null]);
                let counted = operator("$cond", vec![is_null, NativeValue::Int32(0), NativeValue::Int32(1)]);
                accumulator.insert("$sum", counted);
            }
            (_, _, true) => {
                return Err(translation(call.to_string(), "DISTINCT is only supported in COUNT"));
            }
            (_, None, _) => return Err(translation(call.to_string(), "missing argument")),
            (func, Some(value), false) => {
                let op = match func {
                    AggregateFunc::Sum => "$sum",
                    AggregateFunc::Avg => "$avg",
                    AggregateFunc::Min => "$min",
                    _ => "$max",
                };
                accumulator.insert(op, value);
            }
        }
        Ok((accumulator, reference, empty_accumulator(*func, false)))
    }

    /// Final `$project`, then sort and paging
    fn projected_select(
        &self,
        select: &SelectStmt,
        items: &[(&Expr, Option<&String>)],
        ctx: &Context,
        mut stages: Vec<Stage>,
        scope: &mut Scope,
    ) -> Result<Pipeline> {
        let row_scope = matches!(scope, Scope::Row);
        let mut columns: Vec<OutputColumn> = Vec::with_capacity(items.len());
        let mut values = Vec::with_capacity(items.len());

        for (i, (expr, alias)) in items.iter().enumerate() {
            let label = match (alias, expr) {
                (Some(alias), _) => (*alias).clone(),
                (None, Expr::Column(column)) => column.last().to_string(),
                (None, expr) => expr.to_string(),
            };
            let key = if is_simple_key(&label) && !columns.iter().any(|c| c.key == label) {
                label.clone()
            } else {
                format!("_c{}", i)
            };
            let source = match expr {
                Expr::Column(column) if row_scope => Some(ctx.resolve(column)),
                _ => None,
            };
            values.push(projected(self.aggregate_expr(expr, ctx, scope)?));
            columns.push(OutputColumn { label, key, source });
        }

        let mut project = Document::with_capacity(items.len() + 1);
        if !columns.iter().any(|c| c.key == "_id") {
            project.insert("_id", NativeValue::Int32(0));
        }
        for (column, value) in columns.iter().zip(values) {
            project.insert(column.key.as_str(), value);
        }

        let mut sort = Document::new();
        for (i, order) in select.order_by.iter().enumerate() {
            let target = match &order.expr {
                Expr::Literal(Literal::Int(n)) => {
                    let index = usize::try_from(*n)
                        .ok()
                        .and_then(|n| n.checked_sub(1))
                        .filter(|n| *n < columns.len())
                        .ok_or_else(|| translation(order.expr.to_string(), "ORDER BY position is out of range"))?;
                    Some(columns[index].key.clone())
                }
                Expr::Column(column) if column.parts.len() == 1 => items
                    .iter()
                    .zip(&columns)
                    .find(|((_, alias), _)| alias.is_some_and(|a| *a == column.parts[0]))
                    .map(|(_, c)| c.key.clone()),
                _ => None,
            };
            let target = target.or_else(|| {
                items
                    .iter()
                    .zip(&columns)
                    .find(|((expr, _), _)| ctx.same(expr, &order.expr))
                    .map(|(_, c)| c.key.clone())
            });
            let key = match target {
                Some(key) => key,
                None => {
                    let key = format!("_s{}", i);
                    let value = self.aggregate_expr(&order.expr, ctx, scope)?;
                    project.insert(key.as_str(), projected(value));
                    key
                }
            };
            if !sort.contains_key(&key) {
                sort.insert(key, direction(order.direction));
            }
        }

        stages.push(Stage::new(StageKind::Project, project));
        if !sort.is_empty() {
            stages.push(Stage::new(StageKind::Sort, sort));
        }
        stages.extend(self.paging(select)?);

        Ok(Pipeline {
            collection: select.from.name.clone(),
            stages,
            output: Output::Columns(columns),
            default_row: None,
        })
    }

    /// `$skip` then `$limit`
    fn paging(&self, select: &SelectStmt) -> Result<Vec<Stage>> {
        let mut stages = Vec::new();
        if let Some(offset) = &select.offset {
            stages.push(Stage::new(StageKind::Skip, self.count_argument(offset, "OFFSET")?));
        }
        if let Some(limit) = &select.limit {
            stages.push(Stage::new(StageKind::Limit, self.count_argument(limit, "LIMIT")?));
        }
        Ok(stages)
    }

    fn count_argument(&self, expr: &Expr, clause: &str) -> Result<NativeValue> {
        match self.constant_cell(expr)? {
            Some(Cell::Integer(n)) if n >= 0 => Ok(NativeValue::Int64(n)),
            _ => Err(translation(
                expr.to_string(),
                format!("{} must be a non-negative integer", clause),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::native::NativeValue;
    use crate::plan::{Output, Params, Plan, Translator};
    use crate::script::{ScriptBridge, ScriptConfig};
    use serde_json::json;

    fn translate(sql: &str, params: &Params) -> crate::error::Result<Plan> {
        let bridge = ScriptBridge::new(ScriptConfig::default());
        let statement = dsql::parse(sql)?;
        Translator::new(&bridge, params)?.translate(&statement)
    }

    fn explain(sql: &str) -> serde_json::Value {
        translate(sql, &Params::new()).unwrap().explain()["pipeline"].clone()
    }

    #[test]
    fn test_simple_select() {
        assert_eq!(
            explain("SELECT name, age FROM users WHERE age > 30 ORDER BY age LIMIT 2"),
            json!([
                { "$match": { "age": { "$gt": 30 } } },
                { "$project": { "_id": 0, "name": "$name", "age": "$age" } },
                { "$sort": { "age": 1 } },
                { "$limit": 2 }
            ])
        );
    }

    #[test]
    fn test_stage_order_is_fixed() {
        let stages = explain("SELECT * FROM users WHERE a = 1 ORDER BY b DESC LIMIT 5 OFFSET 10");
        assert_eq!(
            stages,
            json!([
                { "$match": { "a": { "$eq": 1 } } },
                { "$sort": { "b": -1 } },
                { "$skip": 10 },
                { "$limit": 5 }
            ])
        );
    }

    #[test]
    fn test_where_operators() {
        let stages = explain(
            "SELECT * FROM t WHERE (a IN (1, 2) OR b IS NULL) AND NOT c LIKE 'x%' AND d BETWEEN 1 AND 5",
        );
        assert_eq!(
            stages[0],
            json!({ "$match": { "$and": [
                { "$or": [ { "a": { "$in": [1, 2] } }, { "b": { "$eq": null } } ] },
                { "$nor": [ { "c": { "$regex": "^x" } } ] },
                { "d": { "$gte": 1, "$lte": 5 } }
            ] } })
        );
    }

    #[test]
    fn test_not_like_filter() {
        let stages = explain("SELECT * FROM t WHERE name NOT LIKE 'A%'");
        assert_eq!(stages[0], json!({ "$match": { "name": { "$not": { "$regex": "^A" } } } }));
    }

    #[test]
    fn test_null_checks_cover_missing_fields() {
        let stages = explain("SELECT COUNT(age) AS n FROM users");
        assert_eq!(
            stages[0],
            json!({ "$group": { "_id": null, "a0": { "$sum": {
                "$cond": [{ "$eq": [{ "$ifNull": ["$age", null] }, null] }, 0, 1]
            } } } })
        );

        let stages = explain("SELECT * FROM t WHERE UPPER(name) IS NULL");
        assert_eq!(
            stages[0],
            json!({ "$match": { "$expr": { "$eq": [{ "$ifNull": [{ "$toUpper": ["$name"] }, null] }, null] } } })
        );
    }

    #[test]
    fn test_column_comparison_uses_expr() {
        let stages = explain("SELECT * FROM t WHERE a > b");
        assert_eq!(stages[0], json!({ "$match": { "$expr": { "$gt": ["$a", "$b"] } } }));
    }

    #[test]
    fn test_constant_on_left_is_flipped() {
        let stages = explain("SELECT * FROM t WHERE 30 < age");
        assert_eq!(stages[0], json!({ "$match": { "age": { "$gt": 30 } } }));
    }

    #[test]
    fn test_group_by() {
        let stages = explain(
            "SELECT city, COUNT(*) AS n, AVG(age) FROM users GROUP BY city HAVING COUNT(*) > 1 ORDER BY n DESC",
        );
        assert_eq!(
            stages,
            json!([
                { "$group": { "_id": { "g0": "$city" }, "a0": { "$sum": 1 }, "a1": { "$avg": "$age" } } },
                { "$match": { "$expr": { "$gt": ["$a0", 1] } } },
                { "$project": { "_id": 0, "city": "$_id.g0", "n": "$a0", "AVG(age)": "$a1" } },
                { "$sort": { "n": -1 } }
            ])
        );
    }

    #[test]
    fn test_ungrouped_column_is_rejected() {
        let err = translate("SELECT name, COUNT(*) FROM users GROUP BY city", &Params::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot translate `name`: column 'name' must appear in GROUP BY or be used in an aggregate"
        );
        assert!(translate("SELECT name, COUNT(*) FROM users", &Params::new()).is_err());
    }

    #[test]
    fn test_ungrouped_aggregate_default_row() {
        let Plan::Query(pipeline) =
            translate("SELECT COUNT(*) AS n, SUM(x) AS s FROM t", &Params::new()).unwrap()
        else {
            panic!("expected a query");
        };
        let row = pipeline.default_row.unwrap();
        assert_eq!(row.get("n"), Some(&NativeValue::Int32(0)));
        assert_eq!(row.get("s"), Some(&NativeValue::Null));
    }

    #[test]
    fn test_count_distinct() {
        let stages = explain("SELECT COUNT(DISTINCT city) AS n FROM users");
        assert_eq!(
            stages[0],
            json!({ "$group": { "_id": null, "a0": { "$addToSet": { "$ifNull": ["$city", "$$REMOVE"] } } } })
        );
        assert_eq!(stages[1], json!({ "$project": { "_id": 0, "n": { "$size": "$a0" } } }));
    }

    #[test]
    fn test_select_distinct() {
        let stages = explain("SELECT DISTINCT city FROM users");
        assert_eq!(stages[0], json!({ "$group": { "_id": { "g0": "$city" } } }));
        assert_eq!(stages[1], json!({ "$project": { "_id": 0, "city": "$_id.g0" } }));

        let stages = explain("SELECT DISTINCT * FROM users");
        assert_eq!(stages[0], json!({ "$group": { "_id": "$$ROOT" } }));
        assert_eq!(stages[1], json!({ "$replaceRoot": { "newRoot": "$_id" } }));
    }

    #[test]
    fn test_join_shapes() {
        let stages = explain(
            "SELECT u.name, o.total FROM users u LEFT JOIN orders o ON o.user_id = u._id WHERE u.age > 20 AND o.total > 5",
        );
        assert_eq!(
            stages,
            json!([
                { "$match": { "age": { "$gt": 20 } } },
                { "$lookup": {
                    "from": "orders",
                    "let": { "v0": "$_id" },
                    "pipeline": [ { "$match": { "$expr": { "$eq": ["$user_id", "$$v0"] } } } ],
                    "as": "o"
                } },
                { "$unwind": { "path": "$o", "preserveNullAndEmptyArrays": true } },
                { "$match": { "o.total": { "$gt": 5 } } },
                { "$project": { "_id": 0, "name": "$name", "total": "$o.total" } }
            ])
        );

        let stages = explain("SELECT * FROM users u JOIN orders o ON o.user_id = u._id");
        assert_eq!(stages[1]["$unwind"]["preserveNullAndEmptyArrays"], json!(false));
    }

    #[test]
    fn test_hidden_sort_key() {
        let stages = explain("SELECT name FROM users ORDER BY age DESC");
        assert_eq!(stages[0], json!({ "$project": { "_id": 0, "name": "$name", "_s0": "$age" } }));
        assert_eq!(stages[1], json!({ "$sort": { "_s0": -1 } }));

        let Plan::Query(pipeline) = translate("SELECT name FROM users ORDER BY age", &Params::new()).unwrap() else {
            panic!("expected a query");
        };
        let Output::Columns(columns) = pipeline.output else {
            panic!("expected explicit columns");
        };
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].source.as_deref(), Some("name"));
    }

    #[test]
    fn test_order_by_position_and_alias() {
        let stages = explain("SELECT name AS n, age FROM users ORDER BY 2 DESC, n");
        assert_eq!(stages[1], json!({ "$sort": { "age": -1, "n": 1 } }));
        assert!(translate("SELECT name FROM users ORDER BY 3", &Params::new()).is_err());
    }

    #[test]
    fn test_computed_columns() {
        let stages = explain("SELECT UPPER(name) AS n, age + 1, 1 AS one FROM users");
        assert_eq!(
            stages[0],
            json!({ "$project": {
                "_id": 0,
                "n": { "$toUpper": ["$name"] },
                "age + 1": { "$add": ["$age", 1] },
                "one": { "$literal": 1 }
            } })
        );
    }

    #[test]
    fn test_parameters() {
        let params = Params::new().push(30i64).bind("city", "Oslo");
        let plan = translate("SELECT * FROM users WHERE age > ? AND city = :city", &params).unwrap();
        assert_eq!(
            plan.explain()["pipeline"][0],
            json!({ "$match": { "$and": [ { "age": { "$gt": 30 } }, { "city": { "$eq": "Oslo" } } ] } })
        );

        let err = translate("SELECT * FROM users WHERE age > ?", &Params::new()).unwrap_err();
        assert!(err.to_string().contains("no value bound"));
    }

    #[test]
    fn test_native_fragment_in_where() {
        let stages = explain("SELECT * FROM users WHERE $${ age: { $gte: 18 } }$$");
        assert_eq!(stages[0], json!({ "$match": { "age": { "$gte": 18 } } }));
    }

    #[test]
    fn test_limit_must_be_non_negative() {
        assert!(translate("SELECT * FROM t LIMIT -1", &Params::new()).is_err());
        let params = Params::new().push(3i64);
        let plan = translate("SELECT * FROM t LIMIT ?", &params).unwrap();
        assert_eq!(plan.explain()["pipeline"][0], json!({ "$limit": 3 }));
    }

    #[test]
    fn test_translation_is_deterministic() {
        let sql = "SELECT u.name, COUNT(*) FROM users u JOIN orders o ON o.uid = u._id GROUP BY u.name";
        assert_eq!(explain(sql), explain(sql));
    }
}
