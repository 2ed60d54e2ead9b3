//! Simple tests for "this NavQL creates this SQL" go here.

use std::collections::HashMap;

use insta::assert_snapshot;
use similar_asserts::assert_eq;

use crate::catalog::fixture::university;
use crate::catalog::{CatalogBuilder, Domain};
use crate::{Dialect, Options};

fn compile(query: &str) -> Result<String, crate::ErrorMessages> {
    crate::compile(query, &university(), &Options::default()).map(|compiled| compiled.sql)
}

fn compile_with(query: &str, options: &Options) -> String {
    crate::compile(query, &university(), options).unwrap().sql
}

#[test]
fn test_class_selects_every_attribute() {
    assert_snapshot!(compile("/school").unwrap(), @"SELECT t1.code AS code, t1.name AS name, t1.campus AS campus FROM school AS t1 ORDER BY t1.code");
}

#[test]
fn test_aggregate_becomes_grouped_left_join() {
    assert_snapshot!(compile("/school{name, count(department)}").unwrap(), @"SELECT t1.name AS name, COALESCE(u1.a0, 0) FROM school AS t1 LEFT JOIN (SELECT t2.school_code AS g0, COUNT(*) AS a0 FROM department AS t2 GROUP BY t2.school_code) AS u1 ON t1.code = u1.g0 ORDER BY t1.code");
}

#[test]
fn test_filter_with_singular_traversal() {
    assert_snapshot!(compile("/course?credits>3&department.school_code='eng'").unwrap(), @"SELECT t1.department_code AS department_code, t1.no AS no, t1.title AS title, t1.credits AS credits, t1.description AS description FROM course AS t1 JOIN department AS t2 ON t1.department_code = t2.code WHERE t1.credits > 3 AND t2.school_code = 'eng' ORDER BY t1.department_code, t1.no");
}

#[test]
fn test_projection_with_complement_count() {
    assert_snapshot!(compile("/school^campus{campus, count(school)}").unwrap(), @"SELECT q1.campus AS campus, COALESCE(u1.a0, 0) FROM (SELECT t1.campus AS campus FROM school AS t1 WHERE t1.campus IS NOT NULL GROUP BY t1.campus) AS q1 LEFT JOIN (SELECT t2.campus AS g0, COUNT(*) AS a0 FROM school AS t2 GROUP BY t2.campus) AS u1 ON q1.campus = u1.g0 ORDER BY q1.campus");
}

#[test]
fn test_reference_to_a_global_average() {
    assert_snapshot!(compile("/define($a:=avg(course.credits)).course{title,credits}?credits>$a").unwrap(), @"SELECT t1.title AS title, t1.credits AS credits FROM course AS t1 WHERE CAST(t1.credits AS DECIMAL) > (SELECT AVG(t2.credits) FROM course AS t2) ORDER BY t1.department_code, t1.no");
}

#[test]
fn test_nested_segment_emits_two_correlated_selects() {
    assert_snapshot!(compile("/school{name, /department{name}}").unwrap(), @r###"
    SELECT t1.name AS name FROM school AS t1 ORDER BY t1.code;

    SELECT t2.name AS name FROM school AS t1 JOIN department AS t2 ON t1.code = t2.school_code ORDER BY t1.code, t2.code
    "###);
}

#[test]
fn test_nested_segment_under_a_limited_parent() {
    assert_snapshot!(compile("/school.limit(2){name, /department{name}}").unwrap(), @r###"
    SELECT t1.name AS name FROM school AS t1 ORDER BY t1.code LIMIT 2;

    SELECT t2.name AS name FROM (SELECT t1.code AS t1_code, t1.name AS t1_name, t1.campus AS t1_campus FROM school AS t1 ORDER BY t1.code LIMIT 2) AS w1 JOIN department AS t2 ON w1.t1_code = t2.school_code ORDER BY w1.t1_code, t2.code
    "###);
}

#[test]
fn test_sort_and_limit() {
    assert_snapshot!(compile("/school.sort(name-).limit(3){name}").unwrap(), @"SELECT t1.name AS name FROM school AS t1 ORDER BY t1.name DESC, t1.code LIMIT 3");

    assert_snapshot!(compile("/school.limit(3, 10){name}").unwrap(), @"SELECT t1.name AS name FROM school AS t1 ORDER BY t1.code LIMIT 3 OFFSET 10");
}

#[test]
fn test_nullable_sort_key_gets_nulls_ordering() {
    assert_snapshot!(compile("/school.sort(campus-){name}").unwrap(), @"SELECT t1.name AS name FROM school AS t1 ORDER BY t1.campus DESC NULLS FIRST, t1.code");
}

#[test]
fn test_partial_link_becomes_left_join() {
    assert_snapshot!(compile("/department{name, school.name}").unwrap(), @"SELECT t1.name AS name, t2.name AS name FROM department AS t1 LEFT JOIN school AS t2 ON t1.school_code = t2.code ORDER BY t1.code");
}

#[test]
fn test_units_share_one_grouped_subquery() {
    assert_snapshot!(compile("/school{count(department), max(department.name)}").unwrap(), @"SELECT COALESCE(u1.a0, 0), u1.a1 FROM school AS t1 LEFT JOIN (SELECT t2.school_code AS g0, COUNT(*) AS a0, MAX(t2.name) AS a1 FROM department AS t2 GROUP BY t2.school_code) AS u1 ON t1.code = u1.g0 ORDER BY t1.code");
}

#[test]
fn test_exists_and_every() {
    assert_snapshot!(compile("/school{name, exists(department)}").unwrap(), @"SELECT t1.name AS name, COALESCE(u1.a0, 0) > 0 FROM school AS t1 LEFT JOIN (SELECT t2.school_code AS g0, COUNT(*) AS a0 FROM department AS t2 GROUP BY t2.school_code) AS u1 ON t1.code = u1.g0 ORDER BY t1.code");

    assert_snapshot!(compile("/department{name, every(course.credits>=3)}").unwrap(), @"SELECT t1.name AS name, COALESCE(u1.a0, 1) = 1 FROM department AS t1 LEFT JOIN (SELECT t2.department_code AS g0, MIN(CASE WHEN t2.credits >= 3 THEN 1 ELSE 0 END) AS a0 FROM course AS t2 GROUP BY t2.department_code) AS u1 ON t1.code = u1.g0 ORDER BY t1.code");
}

#[test]
fn test_fork_compares_against_siblings() {
    assert_snapshot!(compile("/course{title, count(fork(department_code))}").unwrap(), @"SELECT t1.title AS title, COALESCE((SELECT COUNT(*) FROM course AS t2 WHERE t1.department_code = t2.department_code), 0) FROM course AS t1 ORDER BY t1.department_code, t1.no");
}

#[test]
fn test_arbitrary_link() {
    assert_snapshot!(compile("/'eng'->school{code}").unwrap(), @"SELECT t1.code AS code, t1.name AS name, t1.campus AS campus FROM school AS t1 WHERE 'eng' = t1.code ORDER BY t1.code");
}

#[test]
fn test_membership_desugars_to_ors() {
    assert_snapshot!(compile("/school{name}?code={'art','eng'}").unwrap(), @"SELECT t1.name AS name FROM school AS t1 WHERE (t1.code = 'art' OR t1.code = 'eng') ORDER BY t1.code");
}

#[test]
fn test_text_truth_cast_in_logical_context() {
    assert_snapshot!(compile("/school{name}?campus").unwrap(), @"SELECT t1.name AS name FROM school AS t1 WHERE t1.campus IS NOT NULL AND t1.campus <> '' ORDER BY t1.code");
}

#[test]
fn test_strict_equality_with_null_folds_to_null_test() {
    assert_snapshot!(compile("/school{name}?campus==null").unwrap(), @"SELECT t1.name AS name FROM school AS t1 WHERE t1.campus IS NULL ORDER BY t1.code");

    assert_snapshot!(compile("/school{name}?campus!==null").unwrap(), @"SELECT t1.name AS name FROM school AS t1 WHERE t1.campus IS NOT NULL ORDER BY t1.code");

    assert_snapshot!(compile("/school{name}?campus=='north'").unwrap(), @"SELECT t1.name AS name FROM school AS t1 WHERE t1.campus IS NOT DISTINCT FROM 'north' ORDER BY t1.code");
}

#[test]
fn test_case_insensitive_substring() {
    assert_snapshot!(compile("/school{name}?name~'Art'").unwrap(), @"SELECT t1.name AS name FROM school AS t1 WHERE LOWER(t1.name) LIKE '%art%' ORDER BY t1.code");

    let postgres = Options {
        dialect: Dialect::Postgres,
        ..Options::default()
    };
    assert_snapshot!(compile_with("/school{name}?name~'Art'", &postgres), @"SELECT t1.name AS name FROM school AS t1 WHERE t1.name ILIKE '%Art%' ORDER BY t1.code");
}

#[test]
fn test_scalar_functions_and_method_calls() {
    assert_snapshot!(compile("/school{name.upper()}").unwrap(), @"SELECT UPPER(t1.name) FROM school AS t1 ORDER BY t1.code");

    assert_snapshot!(compile("/course{title, if(credits>=4, 'heavy', 'light')}").unwrap(), @"SELECT t1.title AS title, CASE WHEN t1.credits >= 4 THEN 'heavy' ELSE 'light' END FROM course AS t1 ORDER BY t1.department_code, t1.no");
}

#[test]
fn test_exact_decimal_division() {
    assert_snapshot!(compile("/{1/2}").unwrap(), @"SELECT CAST(1 AS DECIMAL) / 2");
}

#[test]
fn test_scalar_root_query() {
    assert_snapshot!(compile("/count(school)").unwrap(), @"SELECT COALESCE((SELECT COUNT(*) FROM school AS t1), 0)");

    assert_snapshot!(compile("/{'a'+'b', 2+2*2}").unwrap(), @"SELECT COALESCE('a', '') || COALESCE('b', ''), 2 + 2 * 2");
}

#[test]
fn test_date_arithmetic_and_literals() {
    assert_snapshot!(compile("/{date('2010-04-15')+30}").unwrap(), @"SELECT DATE '2010-04-15' + 30");

    let sqlite = Options {
        dialect: Dialect::SQLite,
        ..Options::default()
    };
    assert_snapshot!(compile_with("/{date('2010-04-15')}", &sqlite), @"SELECT '2010-04-15'");
}

#[test]
fn test_output_titles() {
    assert_snapshot!(compile("/school{name :as 'School Name'}").unwrap(), @r###"SELECT t1.name AS "School Name" FROM school AS t1 ORDER BY t1.code"###);

    assert_snapshot!(compile("/school{n := name}").unwrap(), @"SELECT t1.name AS n FROM school AS t1 ORDER BY t1.code");
}

#[test]
fn test_indexed_wildcard() {
    assert_snapshot!(compile("/school{*2}").unwrap(), @"SELECT t1.name AS name FROM school AS t1 ORDER BY t1.code");
}

#[test]
fn test_class_attached_calculation() {
    assert_snapshot!(compile("/define(school.longname($n) := length(name)>$n).school{name}?longname(5)").unwrap(), @"SELECT t1.name AS name FROM school AS t1 WHERE CHAR_LENGTH(t1.name) > 5 ORDER BY t1.code");
}

#[test]
fn test_where_introduces_references() {
    assert_snapshot!(compile("/{where($x*2, $x:=21)}").unwrap(), @"SELECT 21 * 2");
}

#[test]
fn test_parameters_are_collected_in_order() {
    let options = Options {
        parameters: HashMap::from([("min".to_string(), Domain::Integer)]),
        ..Options::default()
    };
    let compiled = crate::compile("/course{title}?credits>=$min", &university(), &options).unwrap();
    assert_snapshot!(compiled.sql, @"SELECT t1.title AS title FROM course AS t1 WHERE t1.credits >= ? ORDER BY t1.department_code, t1.no");
    assert_eq!(compiled.parameters.len(), 1);
    assert_eq!(compiled.parameters[0].name, "min");
    assert_eq!(compiled.parameters[0].domain, Domain::Integer);

    let postgres = Options {
        dialect: Dialect::Postgres,
        parameters: HashMap::from([("min".to_string(), Domain::Integer)]),
        ..Options::default()
    };
    let compiled =
        crate::compile("/course{title}?credits>=$min&no>=$min", &university(), &postgres).unwrap();
    assert_snapshot!(compiled.sql, @"SELECT t1.title AS title FROM course AS t1 WHERE t1.credits >= $1 AND t1.no >= $1 ORDER BY t1.department_code, t1.no");
    assert_eq!(compiled.parameters.len(), 1);
}

#[test]
fn test_case_folding_of_identifiers() {
    assert_eq!(
        compile("/school{name}").unwrap(),
        compile("/SCHOOL{NAME}").unwrap()
    );
}

#[test]
fn test_percent_encoded_query_compiles_identically() {
    assert_eq!(
        compile("/school%7Bname%7D").unwrap(),
        compile("/school{name}").unwrap()
    );
}

#[test]
fn test_compilation_is_deterministic() {
    let query = "/school^campus{campus, count(school)}";
    assert_eq!(compile(query).unwrap(), compile(query).unwrap());
}

#[test]
fn test_output_schema() {
    let compiled = crate::compile(
        "/school{name, count(department), /department{name}}",
        &university(),
        &Options::default(),
    )
    .unwrap();
    let columns = &compiled.schema.columns;
    assert_eq!(columns.len(), 3);
    assert_eq!(columns[0].name, "name");
    assert_eq!(columns[0].domain, Domain::Text);
    assert!(!columns[0].nullable);
    assert_eq!(columns[1].name, "count(department)");
    assert_eq!(columns[1].domain, Domain::Integer);
    assert_eq!(columns[2].domain, Domain::Record);
    let nested = columns[2].nested.as_ref().unwrap();
    assert_eq!(nested.columns[0].name, "name");
}

#[test]
fn test_format_decorator_is_surfaced() {
    let compiled = crate::compile("/school/:json", &university(), &Options::default()).unwrap();
    assert_eq!(compiled.format.as_deref(), Some("json"));
}

#[test]
fn test_content_key_tracks_inputs() {
    let catalog = university();
    let none = HashMap::new();
    let key = crate::content_key("/school", &catalog, &none);
    assert_eq!(key, crate::content_key("/school", &catalog, &none));
    assert_ne!(key, crate::content_key("/department", &catalog, &none));
    let typed = HashMap::from([("min".to_string(), Domain::Integer)]);
    assert_ne!(key, crate::content_key("/school", &catalog, &typed));
}

#[test]
fn test_link_shadowing_an_attribute_warns() {
    let mut builder = CatalogBuilder::new();
    builder
        .entity("city")
        .column("id", Domain::Integer)
        .column("name", Domain::Text)
        .primary_key(&["id"]);
    builder
        .entity("street")
        .column("id", Domain::Integer)
        .column("city", Domain::Integer)
        .primary_key(&["id"]);
    builder.foreign_key("street", &["city"], "city");
    let catalog = builder.build().unwrap();

    let compiled =
        crate::compile("/street{city.name}", &catalog, &Options::default()).unwrap();
    assert_eq!(compiled.warnings.len(), 1);
    assert!(compiled.warnings[0].reason.contains("names both"));
    assert_snapshot!(compiled.sql, @"SELECT t2.name AS name FROM street AS t1 JOIN city AS t2 ON t1.city = t2.id ORDER BY t1.id");
}

#[test]
fn test_json_round_trip_of_the_syntax_tree() {
    let query = "/school{name, count(department)}?campus='north'";
    let first = crate::syntax_of_source(query).unwrap();
    let json = crate::json_of_syntax(&first).unwrap();
    let second = crate::syntax_of_json(&json).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_formatted_output_is_reflowed() {
    let options = Options {
        format: true,
        ..Options::default()
    };
    let sql = compile_with("/school{name}", &options);
    assert!(sql.contains('\n'));
    assert!(sql.starts_with("SELECT"));
}

mod errors {
    use super::*;

    fn error_of(query: &str) -> String {
        compile(query).unwrap_err().to_string()
    }

    #[test]
    fn test_unknown_name() {
        assert!(error_of("/schol").contains("not found"));
        assert!(error_of("/school{nmae}").contains("not found"));
    }

    #[test]
    fn test_plural_output_needs_aggregate() {
        assert!(error_of("/school{name, department}").contains("plural"));
        assert!(error_of("/school{department.name}").contains("plural"));
    }

    #[test]
    fn test_aggregate_of_singular() {
        assert!(error_of("/school{count(name)}").contains("singular"));
        assert!(error_of("/department{count(school.name)}").contains("singular"));
    }

    #[test]
    fn test_bad_literal() {
        assert!(error_of("/course?credits>'x'").contains("cannot read"));
        assert!(error_of("/{date('2010-99')}").contains("cannot read"));
    }

    #[test]
    fn test_type_mismatch() {
        assert!(error_of("/course?title>credits").contains("expected"));
        assert!(error_of("/course?credits").contains("expected"));
    }

    #[test]
    fn test_limit_arguments() {
        assert!(error_of("/school.limit(-1)").contains("negative"));
        assert!(error_of("/school.limit(2.5)").contains("integer"));
    }

    #[test]
    fn test_bad_encoding() {
        assert!(error_of("/a%0").contains("percent"));
        assert!(error_of("/a%00").contains("percent"));
    }

    #[test]
    fn test_syntax_error() {
        assert!(compile("/school{name").is_err());
        assert!(compile("/school?").is_err());
    }

    #[test]
    fn test_empty_query() {
        assert!(error_of("/").contains("empty"));
    }

    #[test]
    fn test_complement_outside_projection() {
        assert!(error_of("/school{^}").contains("not found"));
    }

    #[test]
    fn test_limit_inside_aggregate() {
        assert!(error_of("/school{count(department.limit(3))}").contains("not supported"));
    }
}
