//! Upsert and patch SQL generation.
//!
//! Values render as typed SQL literals and statements run through
//! `simple_query`: a multi-row VALUES list mixes uuid, numeric and
//! timestamptz columns in one round trip, and a prepared parameter under an
//! explicit cast takes the cast's type, which a text binding does not
//! satisfy.

use uuid::Uuid;

use crate::extract::{FieldValue, Record};
use crate::schema::TableSpec;

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string as a SQL literal.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Physical target table name: the configured prefix plus the catalog name.
pub fn physical_table(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name)
}

/// Render a field value as a typed SQL literal. Null renders as SQL NULL.
pub fn field_literal(value: &FieldValue) -> String {
    match value {
        FieldValue::Null => "NULL".to_string(),
        FieldValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        FieldValue::I16(n) => n.to_string(),
        FieldValue::I32(n) => n.to_string(),
        FieldValue::I64(n) => n.to_string(),
        FieldValue::Decimal(d) => format!("{}::numeric", d),
        FieldValue::Text(s) => quote_literal(s),
        FieldValue::Uuid(u) => format!("'{}'::uuid", u),
        FieldValue::Timestamp(t) => {
            format!("'{}'::timestamptz", t.format("%Y-%m-%d %H:%M:%S%.6f+00"))
        }
        FieldValue::Json(v) => format!("{}::jsonb", quote_literal(&v.to_string())),
    }
}

/// Build one multi-row upsert statement for a chunk of records.
///
/// Conflict target is the natural key; every non-key column updates from
/// EXCLUDED guarded by IS DISTINCT FROM, so an unchanged row touches
/// nothing. The primary key never updates: a row's minted identity is
/// permanent once loaded. Self-referential FK columns are also left out of
/// the update set: pass one always carries them as null and the patch pass
/// owns them.
pub fn build_upsert_sql(table_name: &str, spec: &TableSpec, records: &[Record]) -> String {
    let cols: Vec<String> = spec.fields.iter().map(|f| f.name.clone()).collect();
    let key_cols = spec.upsert_key();

    let col_list: String = cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let key_list: String = key_cols
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let update_cols: Vec<&String> = cols
        .iter()
        .filter(|c| {
            !key_cols.contains(c)
                && **c != spec.primary_key
                && !spec
                    .fk_for_field(c)
                    .is_some_and(|fk| fk.self_referential)
        })
        .collect();

    let value_rows: Vec<String> = records
        .iter()
        .map(|record| {
            let values: Vec<String> = record
                .values_for(&cols)
                .iter()
                .map(field_literal)
                .collect();
            format!("({})", values.join(", "))
        })
        .collect();

    if update_cols.is_empty() {
        format!(
            "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) DO NOTHING",
            quote_ident(table_name),
            col_list,
            value_rows.join(", "),
            key_list
        )
    } else {
        let set_list: String = update_cols
            .iter()
            .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let change_detection: String = update_cols
            .iter()
            .map(|c| {
                format!(
                    "{}.{} IS DISTINCT FROM EXCLUDED.{}",
                    quote_ident(table_name),
                    quote_ident(c),
                    quote_ident(c)
                )
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        format!(
            "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) DO UPDATE SET {} WHERE {}",
            quote_ident(table_name),
            col_list,
            value_rows.join(", "),
            key_list,
            set_list,
            change_detection
        )
    }
}

/// Statement for the self-reference second pass: set one FK field by row id.
pub fn build_patch_sql(
    table_name: &str,
    spec: &TableSpec,
    field: &str,
    row_id: Uuid,
    parent_id: Uuid,
) -> String {
    format!(
        "UPDATE {} SET {} = '{}'::uuid WHERE {} = '{}'::uuid AND {} IS DISTINCT FROM '{}'::uuid",
        quote_ident(table_name),
        quote_ident(field),
        parent_id,
        quote_ident(&spec.primary_key),
        row_id,
        quote_ident(field),
        parent_id
    )
}

/// Statement listing which of the given primary-key ids exist in the table.
pub fn build_id_lookup_sql(table_name: &str, spec: &TableSpec, ids: &[Uuid]) -> String {
    let pk = quote_ident(&spec.primary_key);
    let list: Vec<String> = ids.iter().map(|id| format!("'{}'::uuid", id)).collect();
    format!(
        "SELECT {}::text FROM {} WHERE {} IN ({})",
        pk,
        quote_ident(table_name),
        pk,
        list.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType, SourceSpec, TargetDb};
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn spec() -> TableSpec {
        let field = |name: &str, field_type: FieldType| FieldSpec {
            name: name.to_string(),
            field_type,
            source: None,
            nullable: true,
            domain: None,
            rule: None,
            blank_as_zero: false,
        };
        TableSpec {
            name: "companies".to_string(),
            db: TargetDb::Core,
            source: SourceSpec::default(),
            primary_key: "id".to_string(),
            natural_key: vec!["code".to_string()],
            source_key: None,
            fields: vec![
                field("id", FieldType::Uuid),
                field("code", FieldType::Text),
                field("beds", FieldType::Integer),
            ],
            foreign_keys: vec![],
            extra_field: None,
            disabled_flag: None,
        }
    }

    #[test]
    fn test_upsert_sql_shape() {
        let spec = spec();
        let mut r = Record::new(&spec);
        r.set("id", FieldValue::Uuid(Uuid::nil()));
        r.set("code", FieldValue::Text("C1".into()));
        r.set("beds", FieldValue::I32(4));

        let sql = build_upsert_sql("mig_companies", &spec, &[r]);
        assert_eq!(
            sql,
            "INSERT INTO \"mig_companies\" (\"id\", \"code\", \"beds\") \
             VALUES ('00000000-0000-0000-0000-000000000000'::uuid, 'C1', 4) \
             ON CONFLICT (\"code\") DO UPDATE SET \"beds\" = EXCLUDED.\"beds\" \
             WHERE \"mig_companies\".\"beds\" IS DISTINCT FROM EXCLUDED.\"beds\""
        );
    }

    #[test]
    fn test_primary_key_never_updates() {
        let spec = spec();
        let sql = build_upsert_sql("companies", &spec, &[Record::new(&spec)]);
        assert!(!sql.contains("\"id\" = EXCLUDED"));
    }

    #[test]
    fn test_multi_row_values() {
        let spec = spec();
        let rows = vec![Record::new(&spec), Record::new(&spec)];
        let sql = build_upsert_sql("companies", &spec, &rows);
        assert!(sql.contains("VALUES (NULL, NULL, NULL), (NULL, NULL, NULL)"));
    }

    #[test]
    fn test_text_values_escape_quotes() {
        let spec = spec();
        let mut r = Record::new(&spec);
        r.set("code", FieldValue::Text("L'Aquila".into()));
        let sql = build_upsert_sql("companies", &spec, &[r]);
        assert!(sql.contains("'L''Aquila'"));
    }

    #[test]
    fn test_key_only_table_does_nothing_on_conflict() {
        let field = |name: &str| FieldSpec {
            name: name.to_string(),
            field_type: FieldType::Uuid,
            source: None,
            nullable: false,
            domain: None,
            rule: None,
            blank_as_zero: false,
        };
        let link = TableSpec {
            name: "udo_production_factors".to_string(),
            db: TargetDb::Core,
            source: SourceSpec::default(),
            primary_key: "udo_id".to_string(),
            natural_key: vec!["udo_id".to_string(), "production_factor_id".to_string()],
            source_key: None,
            fields: vec![field("udo_id"), field("production_factor_id")],
            foreign_keys: vec![],
            extra_field: None,
            disabled_flag: None,
        };
        let sql = build_upsert_sql("udo_production_factors", &link, &[Record::new(&link)]);
        assert!(sql.ends_with("ON CONFLICT (\"udo_id\", \"production_factor_id\") DO NOTHING"));
    }

    #[test]
    fn test_self_referential_column_not_updated_on_conflict() {
        use crate::schema::FkEdge;
        let mut s = spec();
        s.name = "nodes".to_string();
        s.fields.push(FieldSpec {
            name: "parent_node_id".to_string(),
            field_type: FieldType::Uuid,
            source: None,
            nullable: true,
            domain: None,
            rule: None,
            blank_as_zero: false,
        });
        s.foreign_keys.push(FkEdge {
            field: "parent_node_id".to_string(),
            references: "nodes".to_string(),
            ref_field: "id".to_string(),
            nullable: true,
            source: None,
            self_referential: true,
        });
        let sql = build_upsert_sql("nodes", &s, &[Record::new(&s)]);
        assert!(!sql.contains("\"parent_node_id\" = EXCLUDED"));
        assert!(sql.contains("\"beds\" = EXCLUDED.\"beds\""));
    }

    #[test]
    fn test_literal_rendering() {
        assert_eq!(field_literal(&FieldValue::Null), "NULL");
        assert_eq!(field_literal(&FieldValue::Bool(true)), "TRUE");
        assert_eq!(field_literal(&FieldValue::Bool(false)), "FALSE");
        assert_eq!(field_literal(&FieldValue::I32(-7)), "-7");
        assert_eq!(
            field_literal(&FieldValue::Decimal(Decimal::new(455123, 4))),
            "45.5123::numeric"
        );
        assert_eq!(field_literal(&FieldValue::Text("O'Hara".into())), "'O''Hara'");
        assert_eq!(
            field_literal(&FieldValue::Uuid(Uuid::nil())),
            "'00000000-0000-0000-0000-000000000000'::uuid"
        );
        assert_eq!(
            field_literal(&FieldValue::Timestamp(
                chrono::Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap()
            )),
            "'2020-01-02 03:04:05.000000+00'::timestamptz"
        );
        assert_eq!(
            field_literal(&FieldValue::Json(serde_json::json!({"a": "b'c"}))),
            "'{\"a\":\"b''c\"}'::jsonb"
        );
    }

    #[test]
    fn test_patch_sql() {
        let mut s = spec();
        s.name = "nodes".to_string();
        let row = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let parent = Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap();
        assert_eq!(
            build_patch_sql("nodes", &s, "parent_node_id", row, parent),
            "UPDATE \"nodes\" SET \"parent_node_id\" = '22222222-2222-2222-2222-222222222222'::uuid \
             WHERE \"id\" = '11111111-1111-1111-1111-111111111111'::uuid \
             AND \"parent_node_id\" IS DISTINCT FROM '22222222-2222-2222-2222-222222222222'::uuid"
        );
    }

    #[test]
    fn test_id_lookup_sql() {
        let spec = spec();
        let a = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let b = Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap();
        assert_eq!(
            build_id_lookup_sql("companies", &spec, &[a, b]),
            "SELECT \"id\"::text FROM \"companies\" WHERE \"id\" IN \
             ('11111111-1111-1111-1111-111111111111'::uuid, \
             '22222222-2222-2222-2222-222222222222'::uuid)"
        );
    }

    #[test]
    fn test_physical_table_prefix() {
        assert_eq!(physical_table("mig_", "companies"), "mig_companies");
        assert_eq!(physical_table("", "companies"), "companies");
    }
}
