#![allow(dead_code)]

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement};
use sea_tree::{TreeEngine, TreeError, TreeNode};

pub mod entity {
    pub mod ns_node {
        use sea_orm::entity::prelude::*;
        use sea_tree::NestedSetsNodeDerive as NestedSetsNode;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel, NestedSetsNode)]
        #[sea_orm(table_name = "ns_nodes")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub name: String,
            pub lft: i32,
            pub rgt: i32,
            pub top_level: Option<i32>,
            pub valid_from: Option<DateTimeUtc>,
            pub valid_to: Option<DateTimeUtc>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod ct_node {
        use sea_orm::entity::prelude::*;
        use sea_tree::ClosureTableNodeDerive as ClosureTableNode;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel, ClosureTableNode)]
        #[sea_orm(table_name = "ct_nodes")]
        #[sea_tree(path_module = "crate::common::entity::ct_path")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub name: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod ct_path {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
        #[sea_orm(table_name = "ct_paths")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub ancestor_id: i32,
            pub descendant_id: i32,
            pub depth: i32,
            pub order_index: i32,
            pub valid_from: Option<DateTimeUtc>,
            pub valid_to: Option<DateTimeUtc>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

pub use entity::{ct_node, ct_path, ns_node};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE ns_nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        lft INTEGER NOT NULL,
        rgt INTEGER NOT NULL,
        top_level INTEGER,
        valid_from TEXT,
        valid_to TEXT
    )
    "#,
    r#"
    CREATE TABLE ct_nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE ct_paths (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ancestor_id INTEGER NOT NULL REFERENCES ct_nodes(id),
        descendant_id INTEGER NOT NULL REFERENCES ct_nodes(id),
        depth INTEGER NOT NULL,
        order_index INTEGER NOT NULL,
        valid_from TEXT,
        valid_to TEXT
    )
    "#,
];

/// Fresh in-memory database; a single pooled connection keeps it alive.
pub async fn setup_database() -> Result<DatabaseConnection, sea_orm::DbErr> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(options).await?;

    for sql in SCHEMA {
        db.execute(Statement::from_string(DbBackend::Sqlite, *sql)).await?;
    }
    Ok(db)
}

pub fn ns(name: &str) -> ns_node::ActiveModel {
    ns_node::ActiveModel {
        name: sea_orm::ActiveValue::Set(name.to_owned()),
        ..Default::default()
    }
}

pub fn ct(name: &str) -> ct_node::ActiveModel {
    ct_node::ActiveModel {
        name: sea_orm::ActiveValue::Set(name.to_owned()),
        ..Default::default()
    }
}

pub fn ns_names(nodes: &[ns_node::Model]) -> Vec<&str> {
    nodes.iter().map(|node| node.name.as_str()).collect()
}

pub fn ct_names(nodes: &[ct_node::Model]) -> Vec<&str> {
    nodes.iter().map(|node| node.name.as_str()).collect()
}

/// ROOT{A{A1}, B{B1, B2}, C{C1{C11}}}
pub struct Fixture<M> {
    pub root: M,
    pub a: M,
    pub a1: M,
    pub b: M,
    pub b1: M,
    pub b2: M,
    pub c: M,
    pub c1: M,
    pub c11: M,
}

pub async fn build_fixture<M, E>(
    engine: &E,
    db: &DatabaseConnection,
    node: fn(&str) -> M::ActiveModel,
) -> Result<Fixture<M>, TreeError>
where
    M: TreeNode,
    E: TreeEngine<M>,
{
    let root = engine.create_root(db, node("ROOT")).await?;
    let a = engine.add_child(db, &root, node("A")).await?;
    let b = engine.add_child(db, &root, node("B")).await?;
    let c = engine.add_child(db, &root, node("C")).await?;
    let a1 = engine.add_child(db, &a, node("A1")).await?;
    let b1 = engine.add_child(db, &b, node("B1")).await?;
    let b2 = engine.add_child(db, &b, node("B2")).await?;
    let c1 = engine.add_child(db, &c, node("C1")).await?;
    let c11 = engine.add_child(db, &c1, node("C11")).await?;

    Ok(Fixture {
        root,
        a,
        a1,
        b,
        b1,
        b2,
        c,
        c1,
        c11,
    })
}

/// Interval bounds of one nested-sets tree cover `1..=2n` exactly once.
pub fn assert_contiguous(tree: &[ns_node::Model]) {
    let mut bounds: Vec<i32> = tree.iter().flat_map(|node| [node.lft, node.rgt]).collect();
    bounds.sort_unstable();
    let expected: Vec<i32> = (1..=i32::try_from(tree.len() * 2).unwrap()).collect();
    assert_eq!(bounds, expected);
}
