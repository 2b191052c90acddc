mod common;

use common::{assert_contiguous, build_fixture, ns, ns_names, ns_node, setup_database};
use sea_orm::EntityTrait;
use sea_tree::{Criteria, NestedSetsTree, Position, TreeEngine, TreeError};

type Tree = NestedSetsTree<ns_node::Model>;

async fn reload(db: &sea_orm::DatabaseConnection, node: &ns_node::Model) -> ns_node::Model {
    ns_node::Entity::find_by_id(node.id)
        .one(db)
        .await
        .expect("query succeeds")
        .expect("node exists")
}

#[tokio::test]
async fn fixture_has_expected_shape() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ns).await?;

    let root = reload(&db, &f.root).await;
    assert_eq!((root.lft, root.rgt), (1, 18));
    assert_eq!(tree.size(&db, &root).await?, 9);
    assert_eq!(tree.level(&db, &f.c11).await?, 3);
    assert_eq!(tree.level(&db, &f.root).await?, 0);
    assert_eq!(ns_names(&tree.path(&db, &f.c11).await?), ["ROOT", "C", "C1"]);
    assert_eq!(ns_names(&tree.children(&db, &root).await?), ["A", "B", "C"]);
    assert_eq!(tree.child_count(&db, &f.b).await?, 2);

    let all = tree.tree(&db, &root).await?;
    assert_eq!(
        ns_names(&all),
        ["ROOT", "A", "A1", "B", "B1", "B2", "C", "C1", "C11"]
    );
    assert_contiguous(&all);

    assert!(tree.is_leaf(&db, &f.a1).await?);
    assert!(!tree.is_leaf(&db, &f.a).await?);
    assert!(tree.is_root(&db, &f.root).await?);
    assert!(!tree.is_root(&db, &f.a).await?);
    assert_eq!(tree.parent(&db, &f.a1).await?.map(|node| node.name), Some("A".into()));
    assert!(tree.parent(&db, &f.root).await?.is_none());
    assert_eq!(tree.root(&db, &f.c11).await?.id, f.root.id);
    assert_eq!(ns_names(&tree.roots(&db).await?), ["ROOT"]);

    assert!(tree.is_child_of(&db, &f.c11, &f.c).await?);
    assert!(!tree.is_child_of(&db, &f.c, &f.c11).await?);
    assert!(!tree.is_child_of(&db, &f.c, &f.c).await?);
    assert!(tree.is_equal_to_or_child_of(&db, &f.c, &f.c).await?);

    Ok(())
}

#[tokio::test]
async fn cached_tree_answers_without_queries() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ns).await?;

    let cached = tree.tree_cacheable(&db, &f.root).await?;
    assert_eq!(ns_names(&tree.find_direct_children(&cached)), ["A", "B", "C"]);

    let sub = tree.find_sub_tree(&f.c, &cached)?;
    assert_eq!(ns_names(&sub), ["C", "C1", "C11"]);
    assert_eq!(ns_names(&tree.find_direct_children(&sub)), ["C1"]);

    Ok(())
}

#[tokio::test]
async fn find_by_criteria_within_subtree() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ns).await?;

    let criteria = Criteria::<ns_node::Entity>::new().eq(ns_node::Column::Name, "B1");
    assert_eq!(tree.find_by(&db, None, &criteria).await?.len(), 1);
    assert_eq!(tree.find_by(&db, Some(&f.b), &criteria).await?.len(), 1);
    assert!(tree.find_by(&db, Some(&f.a), &criteria).await?.is_empty());
    assert_eq!(tree.find_by(&db, Some(&f.b), &Criteria::new()).await?.len(), 3);

    assert_eq!(tree.find(&db, f.c1.id).await?.map(|node| node.name), Some("C1".into()));
    assert!(tree.find(&db, 4242).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn add_child_at_position() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ns).await?;

    tree.add_child_at(&db, &f.root, ns("first"), Position::At(0)).await?;
    tree.add_child_at(&db, &f.root, ns("second"), Position::At(2)).await?;
    tree.add_child_at(&db, &f.root, ns("last"), Position::At(99)).await?;
    tree.add_child_before(&db, &f.c, ns("before C")).await?;

    assert_eq!(
        ns_names(&tree.children(&db, &f.root).await?),
        ["first", "A", "second", "B", "before C", "C", "last"]
    );
    assert_contiguous(&tree.tree(&db, &f.root).await?);

    Ok(())
}

#[tokio::test]
async fn move_sequence_keeps_intervals() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ns).await?;

    tree.move_to(&db, &f.a, &f.root, Position::At(1)).await?;
    assert_eq!(ns_names(&tree.children(&db, &f.root).await?), ["B", "A", "C"]);

    tree.move_before(&db, &f.c, &f.b).await?;
    assert_eq!(ns_names(&tree.children(&db, &f.root).await?), ["C", "B", "A"]);

    tree.move_node(&db, &f.b1, &f.c).await?;
    assert_eq!(ns_names(&tree.children(&db, &f.c).await?), ["C1", "B1"]);
    assert_eq!(ns_names(&tree.children(&db, &f.b).await?), ["B2"]);

    tree.move_before(&db, &f.a, &f.a).await?;
    tree.move_to(&db, &f.a, &f.root, Position::At(2)).await?;
    assert_eq!(ns_names(&tree.children(&db, &f.root).await?), ["C", "B", "A"]);

    let all = tree.tree(&db, &f.root).await?;
    assert_eq!(all.len(), 9);
    assert_contiguous(&all);
    assert_eq!(ns_names(&tree.path(&db, &f.b1).await?), ["ROOT", "C"]);

    Ok(())
}

#[tokio::test]
async fn move_into_own_subtree_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ns).await?;

    let err = tree.move_node(&db, &f.c, &f.c11).await.unwrap_err();
    assert!(matches!(err, TreeError::StructuralPrecondition(_)));
    let err = tree.move_node(&db, &f.c, &f.c).await.unwrap_err();
    assert!(matches!(err, TreeError::StructuralPrecondition(_)));
    let err = tree.add_child_before(&db, &f.root, ns("beside root")).await.unwrap_err();
    assert!(matches!(err, TreeError::StructuralPrecondition(_)));

    let persistent: ns_node::ActiveModel = f.a1.clone().into();
    let err = tree.add_child(&db, &f.b, persistent).await.unwrap_err();
    assert!(matches!(err, TreeError::StructuralPrecondition(_)));

    assert_contiguous(&tree.tree(&db, &f.root).await?);
    Ok(())
}

#[tokio::test]
async fn move_between_trees() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ns).await?;

    tree.move_to_be_root(&db, &f.c).await?;
    assert_eq!(ns_names(&tree.roots(&db).await?), ["ROOT", "C"]);
    assert!(tree.is_root(&db, &f.c).await?);
    assert_eq!(tree.size(&db, &f.root).await?, 6);

    let detached = tree.tree(&db, &f.c).await?;
    assert_eq!(ns_names(&detached), ["C", "C1", "C11"]);
    assert_contiguous(&detached);
    assert_contiguous(&tree.tree(&db, &f.root).await?);
    assert_eq!(tree.root(&db, &f.c11).await?.id, f.c.id);

    // already a root
    tree.move_to_be_root(&db, &f.c).await?;
    assert_eq!(tree.roots(&db).await?.len(), 2);

    tree.move_node(&db, &f.c, &f.a).await?;
    assert_eq!(ns_names(&tree.roots(&db).await?), ["ROOT"]);
    assert_eq!(ns_names(&tree.children(&db, &f.a).await?), ["A1", "C"]);
    assert_eq!(tree.level(&db, &f.c11).await?, 4);

    let all = tree.tree(&db, &f.root).await?;
    assert_eq!(all.len(), 9);
    assert_contiguous(&all);

    Ok(())
}

#[tokio::test]
async fn copy_subtrees() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ns).await?;

    let copy = tree.copy_node(&db, &f.b, &f.a, None).await?;
    assert_eq!(copy.name, "B");
    assert_ne!(copy.id, f.b.id);
    assert_eq!(ns_names(&tree.children(&db, &f.a).await?), ["A1", "B"]);
    assert_eq!(ns_names(&tree.children(&db, &copy).await?), ["B1", "B2"]);

    let renamed = tree
        .copy_to(&db, &f.c, &f.root, Position::At(0), Some(ns("C copy")))
        .await?;
    assert_eq!(renamed.name, "C copy");
    assert_eq!(
        ns_names(&tree.children(&db, &f.root).await?),
        ["C copy", "A", "B", "C"]
    );
    assert_eq!(ns_names(&tree.tree(&db, &renamed).await?), ["C copy", "C1", "C11"]);

    let all = tree.tree(&db, &f.root).await?;
    assert_eq!(all.len(), 15);
    assert_contiguous(&all);

    Ok(())
}

#[tokio::test]
async fn copy_next_to_itself() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ns).await?;

    let err = tree.copy_node(&db, &f.b, &f.b, None).await.unwrap_err();
    assert!(matches!(err, TreeError::StructuralPrecondition(_)));

    tree.copy_before(&db, &f.b, &f.b, None).await?;
    assert_eq!(ns_names(&tree.children(&db, &f.root).await?), ["A", "B", "B", "C"]);
    assert_contiguous(&tree.tree(&db, &f.root).await?);

    Ok(())
}

#[tokio::test]
async fn copy_to_be_root_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ns).await?;

    let copy = tree.copy_to_be_root(&db, &f.c, Some(ns("C root"))).await?;
    assert_eq!((copy.lft, copy.rgt, copy.top_level), (1, 6, Some(copy.id)));
    assert!(tree.is_root(&db, &copy).await?);
    assert_eq!(ns_names(&tree.roots(&db).await?), ["ROOT", "C root"]);
    assert_eq!(ns_names(&tree.tree(&db, &copy).await?), ["C root", "C1", "C11"]);
    assert_eq!(tree.size(&db, &f.root).await?, 9);

    let back = tree.copy_node(&db, &copy, &f.b, None).await?;
    assert_eq!(ns_names(&tree.children(&db, &f.b).await?), ["B1", "B2", "C root"]);
    assert_eq!(tree.size(&db, &back).await?, 3);
    assert_contiguous(&tree.tree(&db, &f.root).await?);

    Ok(())
}

#[tokio::test]
async fn copied_node_renamer_runs_on_every_clone() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new().with_copied_node_renamer(|node: &mut ns_node::ActiveModel| {
        if let sea_orm::ActiveValue::Set(name) | sea_orm::ActiveValue::Unchanged(name) = node.name.clone() {
            node.name = sea_orm::ActiveValue::Set(format!("{name}'"));
        }
    });
    let f = build_fixture(&tree, &db, ns).await?;

    let copy = tree.copy_node(&db, &f.c, &f.a, None).await?;
    assert_eq!(ns_names(&tree.tree(&db, &copy).await?), ["C'", "C1'", "C11'"]);
    Ok(())
}

#[tokio::test]
async fn remove_closes_the_gap() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ns).await?;

    tree.remove(&db, &f.b).await?;
    assert_eq!(ns_names(&tree.children(&db, &f.root).await?), ["A", "C"]);
    assert!(tree.find(&db, f.b1.id).await?.is_none());

    let all = tree.tree(&db, &f.root).await?;
    assert_eq!(all.len(), 6);
    assert_contiguous(&all);

    tree.remove_all(&db).await?;
    assert!(tree.roots(&db).await?.is_empty());
    assert!(ns_node::Entity::find().all(&db).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn update_persists_properties() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ns).await?;

    let mut active: ns_node::ActiveModel = f.b2.clone().into();
    active.name = sea_orm::ActiveValue::Set("B two".into());
    let updated = tree.update(&db, active).await?;
    assert_eq!(updated.name, "B two");
    assert_eq!(ns_names(&tree.children(&db, &f.b).await?), ["B1", "B two"]);

    let err = tree.update(&db, ns("transient")).await.unwrap_err();
    assert!(matches!(err, TreeError::StructuralPrecondition(_)));

    assert!(!tree.is_persistent(&ns("transient")));
    assert!(tree.is_persistent(&ns_node::ActiveModel::from(f.b2.clone())));
    Ok(())
}

#[tokio::test]
async fn concurrent_inserts_are_serialized() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ns).await?;

    // both start from the same stale bounds
    let (x, y) = tokio::join!(
        tree.add_child_at(&db, &f.b, ns("X"), Position::At(0)),
        tree.add_child_at(&db, &f.a, ns("Y"), Position::At(0)),
    );
    x?;
    y?;

    assert_eq!(ns_names(&tree.children(&db, &f.a).await?), ["Y", "A1"]);
    assert_eq!(ns_names(&tree.children(&db, &f.b).await?), ["X", "B1", "B2"]);
    let all = tree.tree(&db, &f.root).await?;
    assert_eq!(all.len(), 11);
    assert_contiguous(&all);
    Ok(())
}
