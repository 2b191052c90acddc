mod common;

use common::{build_fixture, ct, ct_names, ct_node, ct_path, setup_database};
use sea_orm::{ActiveModelTrait, ActiveValue, ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use sea_tree::{
    ClosureTableTree, Criteria, NodeRemoval, OrderTracking, Position, TreeEngine, TreeError,
    TreeOptions, NO_ORDER_INDEX,
};

type Tree = ClosureTableTree<ct_node::Model>;

/// `(name, order_index)` of the direct children of `parent`, by order index.
async fn order_of(
    db: &sea_orm::DatabaseConnection,
    parent: &ct_node::Model,
) -> Result<Vec<(String, i32)>, Box<dyn std::error::Error>> {
    let links = ct_path::Entity::find()
        .filter(ct_path::Column::AncestorId.eq(parent.id))
        .filter(ct_path::Column::Depth.eq(1))
        .order_by_asc(ct_path::Column::OrderIndex)
        .all(db)
        .await?;
    let mut order = Vec::with_capacity(links.len());
    for link in links {
        let child = ct_node::Entity::find_by_id(link.descendant_id)
            .one(db)
            .await?
            .ok_or("linked node exists")?;
        order.push((child.name, link.order_index));
    }
    Ok(order)
}

/// Write a path row behind the engine's back.
async fn insert_path(
    db: &sea_orm::DatabaseConnection,
    ancestor: &ct_node::Model,
    descendant: &ct_node::Model,
    depth: i32,
    order_index: i32,
) -> Result<(), sea_orm::DbErr> {
    ct_path::ActiveModel {
        ancestor_id: ActiveValue::Set(ancestor.id),
        descendant_id: ActiveValue::Set(descendant.id),
        depth: ActiveValue::Set(depth),
        order_index: ActiveValue::Set(order_index),
        ..Default::default()
    }
    .insert(db)
    .await?;
    Ok(())
}

fn sorted(mut names: Vec<&str>) -> Vec<&str> {
    names.sort_unstable();
    names
}

fn entries(names: &[&str]) -> Vec<(String, i32)> {
    names
        .iter()
        .enumerate()
        .map(|(index, name)| (name.to_string(), index as i32))
        .collect()
}

#[tokio::test]
async fn fixture_has_expected_shape() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ct).await?;

    assert_eq!(tree.size(&db, &f.root).await?, 9);
    assert_eq!(tree.level(&db, &f.c11).await?, 3);
    assert_eq!(tree.level(&db, &f.root).await?, 0);
    assert_eq!(ct_names(&tree.path(&db, &f.c11).await?), ["ROOT", "C", "C1"]);
    assert_eq!(ct_names(&tree.children(&db, &f.root).await?), ["A", "B", "C"]);
    assert_eq!(tree.child_count(&db, &f.b).await?, 2);
    assert_eq!(
        ct_names(&tree.tree(&db, &f.root).await?),
        ["ROOT", "A", "A1", "B", "B1", "B2", "C", "C1", "C11"]
    );

    assert!(tree.is_leaf(&db, &f.a1).await?);
    assert!(!tree.is_leaf(&db, &f.a).await?);
    assert!(tree.is_root(&db, &f.root).await?);
    assert!(!tree.is_root(&db, &f.b1).await?);
    assert_eq!(tree.parent(&db, &f.b2).await?.map(|node| node.name), Some("B".into()));
    assert!(tree.parent(&db, &f.root).await?.is_none());
    assert_eq!(tree.root(&db, &f.c11).await?.id, f.root.id);
    assert_eq!(ct_names(&tree.roots(&db).await?), ["ROOT"]);
    assert!(tree.is_child_of(&db, &f.c11, &f.root).await?);
    assert!(!tree.is_child_of(&db, &f.root, &f.c11).await?);

    let self_path = tree.self_path(&db, &f.b).await?.ok_or("self path exists")?;
    assert_eq!((self_path.depth, self_path.order_index), (0, NO_ORDER_INDEX));
    assert_eq!(order_of(&db, &f.root).await?, entries(&["A", "B", "C"]));

    // one path per (ancestor, descendant) pair
    assert_eq!(ct_path::Entity::find().all(&db).await?.len(), 9 + 8 + 5 + 1);
    Ok(())
}

#[tokio::test]
async fn cached_subtree() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ct).await?;

    let cached = tree.tree_cacheable(&db, &f.root).await?;
    assert_eq!(cached.len(), 9);
    assert_eq!(ct_names(&tree.find_direct_children(&cached)), ["A", "B", "C"]);

    let sub = tree.find_sub_tree(&f.c, &cached)?;
    assert_eq!(ct_names(sub.as_slice()), ["C", "C1", "C11"]);
    assert_eq!(ct_names(&tree.find_direct_children(&sub)), ["C1"]);

    let outsider = tree.create_root(&db, ct("elsewhere")).await?;
    let err = tree.find_sub_tree(&outsider, &cached).unwrap_err();
    assert!(matches!(err, TreeError::StructuralPrecondition(_)));
    Ok(())
}

#[tokio::test]
async fn find_by_criteria_within_subtree() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ct).await?;

    let criteria = Criteria::<ct_node::Entity>::new().eq(ct_node::Column::Name, "C11");
    assert_eq!(tree.find_by(&db, None, &criteria).await?.len(), 1);
    assert_eq!(tree.find_by(&db, Some(&f.c), &criteria).await?.len(), 1);
    assert!(tree.find_by(&db, Some(&f.b), &criteria).await?.is_empty());
    assert_eq!(tree.find_by(&db, Some(&f.c), &Criteria::new()).await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn insert_positions_are_tracked() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ct).await?;

    tree.add_child_at(&db, &f.root, ct("first"), Position::At(0)).await?;
    tree.add_child_at(&db, &f.root, ct("second"), Position::At(2)).await?;
    tree.add_child_at(&db, &f.root, ct("last"), Position::At(99)).await?;
    tree.add_child_before(&db, &f.c, ct("before C")).await?;

    assert_eq!(
        order_of(&db, &f.root).await?,
        entries(&["first", "A", "second", "B", "before C", "C", "last"])
    );
    Ok(())
}

#[tokio::test]
async fn move_sequence_renumbers_siblings() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ct).await?;

    tree.move_to(&db, &f.a, &f.root, Position::At(1)).await?;
    assert_eq!(order_of(&db, &f.root).await?, entries(&["B", "A", "C"]));

    tree.move_before(&db, &f.c, &f.b).await?;
    assert_eq!(order_of(&db, &f.root).await?, entries(&["C", "B", "A"]));

    tree.move_node(&db, &f.b1, &f.c).await?;
    assert_eq!(order_of(&db, &f.c).await?, entries(&["C1", "B1"]));
    assert_eq!(order_of(&db, &f.b).await?, entries(&["B2"]));
    assert_eq!(ct_names(&tree.path(&db, &f.b1).await?), ["ROOT", "C"]);

    tree.move_node(&db, &f.c1, &f.a1).await?;
    assert_eq!(ct_names(&tree.path(&db, &f.c11).await?), ["ROOT", "A", "A1", "C1"]);
    assert_eq!(tree.level(&db, &f.c11).await?, 4);
    assert_eq!(tree.size(&db, &f.root).await?, 9);
    assert!(!tree.is_child_of(&db, &f.c11, &f.c).await?);
    Ok(())
}

#[tokio::test]
async fn move_into_own_subtree_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ct).await?;

    let err = tree.move_node(&db, &f.c, &f.c11).await.unwrap_err();
    assert!(matches!(err, TreeError::StructuralPrecondition(_)));
    let err = tree.move_before(&db, &f.a, &f.root).await.unwrap_err();
    assert!(matches!(err, TreeError::StructuralPrecondition(_)));
    let err = tree.add_child_before(&db, &f.root, ct("beside root")).await.unwrap_err();
    assert!(matches!(err, TreeError::StructuralPrecondition(_)));
    let err = tree.add_child(&db, &f.b, f.a1.clone().into()).await.unwrap_err();
    assert!(matches!(err, TreeError::StructuralPrecondition(_)));

    assert_eq!(tree.size(&db, &f.root).await?, 9);
    Ok(())
}

#[tokio::test]
async fn persistent_node_without_paths_can_join() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ct).await?;

    let loose = ct("loose").insert(&db).await?;
    let joined = tree.add_child(&db, &f.a, loose.clone().into()).await?;
    assert_eq!(joined.id, loose.id);
    assert_eq!(ct_names(&tree.children(&db, &f.a).await?), ["A1", "loose"]);
    Ok(())
}

#[tokio::test]
async fn move_between_trees() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ct).await?;

    tree.move_to_be_root(&db, &f.b).await?;
    assert_eq!(ct_names(&tree.roots(&db).await?), ["ROOT", "B"]);
    assert_eq!(order_of(&db, &f.root).await?, entries(&["A", "C"]));
    assert_eq!(ct_names(&tree.tree(&db, &f.b).await?), ["B", "B1", "B2"]);
    assert_eq!(tree.root(&db, &f.b2).await?.id, f.b.id);

    tree.move_to_be_root(&db, &f.b).await?;
    assert_eq!(tree.roots(&db).await?.len(), 2);

    tree.move_to(&db, &f.b, &f.c1, Position::At(0)).await?;
    assert_eq!(ct_names(&tree.roots(&db).await?), ["ROOT"]);
    assert_eq!(order_of(&db, &f.c1).await?, entries(&["B", "C11"]));
    assert_eq!(ct_names(&tree.path(&db, &f.b2).await?), ["ROOT", "C", "C1", "B"]);
    assert_eq!(tree.size(&db, &f.root).await?, 9);
    Ok(())
}

#[tokio::test]
async fn copy_subtrees() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ct).await?;

    let copy = tree.copy_node(&db, &f.b, &f.a, None).await?;
    assert_ne!(copy.id, f.b.id);
    assert_eq!(order_of(&db, &f.a).await?, entries(&["A1", "B"]));
    assert_eq!(order_of(&db, &copy).await?, entries(&["B1", "B2"]));
    assert_eq!(ct_names(&tree.path(&db, &copy).await?), ["ROOT", "A"]);

    let renamed = tree
        .copy_to(&db, &f.c, &f.root, Position::At(0), Some(ct("C copy")))
        .await?;
    assert_eq!(renamed.name, "C copy");
    assert_eq!(
        order_of(&db, &f.root).await?,
        entries(&["C copy", "A", "B", "C"])
    );
    assert_eq!(ct_names(&tree.tree(&db, &renamed).await?), ["C copy", "C1", "C11"]);
    assert_eq!(tree.size(&db, &f.root).await?, 15);

    let err = tree.copy_node(&db, &f.b, &f.b1, None).await.unwrap_err();
    assert!(matches!(err, TreeError::StructuralPrecondition(_)));

    tree.copy_before(&db, &f.b, &f.b, None).await?;
    assert_eq!(
        ct_names(&tree.children(&db, &f.root).await?),
        ["C copy", "A", "B", "B", "C"]
    );
    Ok(())
}

#[tokio::test]
async fn copy_to_be_root_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new().with_copied_node_renamer(|node: &mut ct_node::ActiveModel| {
        if let sea_orm::ActiveValue::Set(name) = node.name.clone() {
            node.name = sea_orm::ActiveValue::Set(name.to_lowercase());
        }
    });
    let f = build_fixture(&tree, &db, ct).await?;

    let copy = tree.copy_to_be_root(&db, &f.c, None).await?;
    assert!(tree.is_root(&db, &copy).await?);
    assert_eq!(ct_names(&tree.roots(&db).await?), ["ROOT", "c"]);
    assert_eq!(ct_names(&tree.tree(&db, &copy).await?), ["c", "c1", "c11"]);

    let back = tree.copy_node(&db, &copy, &f.b, None).await?;
    assert_eq!(ct_names(&tree.children(&db, &f.b).await?), ["B1", "B2", "c"]);
    assert_eq!(tree.size(&db, &back).await?, 3);
    assert_eq!(tree.size(&db, &f.root).await?, 12);
    Ok(())
}

#[tokio::test]
async fn remove_keeps_node_rows_by_default() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ct).await?;

    tree.remove(&db, &f.b).await?;
    assert_eq!(order_of(&db, &f.root).await?, entries(&["A", "C"]));
    assert_eq!(tree.size(&db, &f.root).await?, 6);
    assert!(tree.self_path(&db, &f.b1).await?.is_none());
    assert!(tree.find(&db, f.b1.id).await?.is_some());

    tree.remove_all(&db).await?;
    assert!(tree.roots(&db).await?.is_empty());
    assert_eq!(ct_node::Entity::find().all(&db).await?.len(), 9);
    Ok(())
}

#[tokio::test]
async fn remove_can_delete_node_rows() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new().with_options(TreeOptions::default().node_removal(NodeRemoval::DeleteNodes));
    let f = build_fixture(&tree, &db, ct).await?;

    tree.remove(&db, &f.c).await?;
    assert!(tree.find(&db, f.c11.id).await?.is_none());
    assert_eq!(ct_node::Entity::find().all(&db).await?.len(), 6);

    tree.remove_all(&db).await?;
    assert!(ct_node::Entity::find().all(&db).await?.is_empty());
    assert!(ct_path::Entity::find().all(&db).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn duplicate_paths_are_corruption() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ct).await?;

    insert_path(&db, &f.a, &f.b1, 1, 0).await?;
    let err = tree.parent(&db, &f.b1).await.unwrap_err();
    assert!(matches!(err, TreeError::IntegrityCorruption(_)));

    insert_path(&db, &f.root, &f.c11, 3, NO_ORDER_INDEX).await?;
    let err = tree.is_child_of(&db, &f.c11, &f.root).await.unwrap_err();
    assert!(matches!(err, TreeError::IntegrityCorruption(_)));

    insert_path(&db, &f.b, &f.b, 0, NO_ORDER_INDEX).await?;
    let err = tree.self_path(&db, &f.b).await.unwrap_err();
    assert!(matches!(err, TreeError::IntegrityCorruption(_)));

    // not copied into a new child
    let err = tree.add_child(&db, &f.b, ct("X")).await.unwrap_err();
    assert!(matches!(err, TreeError::IntegrityCorruption(_)));
    assert_eq!(ct_node::Entity::find().all(&db).await?.len(), 9);

    // untouched nodes still answer
    assert_eq!(tree.parent(&db, &f.a1).await?.map(|node| node.id), Some(f.a.id));
    Ok(())
}

#[tokio::test]
async fn untracked_order_writes_zero() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new().with_options(TreeOptions::default().order_tracking(OrderTracking::Untracked));
    let f = build_fixture(&tree, &db, ct).await?;

    tree.add_child_at(&db, &f.root, ct("first"), Position::At(0)).await?;
    tree.move_node(&db, &f.b1, &f.a).await?;
    tree.remove(&db, &f.c1).await?;

    let paths = ct_path::Entity::find().all(&db).await?;
    assert!(paths.iter().filter(|path| path.depth == 1).all(|path| path.order_index == 0));
    assert!(paths
        .iter()
        .filter(|path| path.depth != 1)
        .all(|path| path.order_index == NO_ORDER_INDEX));

    assert_eq!(
        sorted(ct_names(&tree.children(&db, &f.root).await?)),
        ["A", "B", "C", "first"]
    );
    assert_eq!(sorted(ct_names(&tree.children(&db, &f.a).await?)), ["A1", "B1"]);
    assert_eq!(ct_names(&tree.children(&db, &f.b).await?), ["B2"]);
    assert!(tree.is_leaf(&db, &f.c).await?);
    Ok(())
}

#[tokio::test]
async fn concurrent_inserts_keep_order_contiguous() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_database().await?;
    let tree = Tree::new();
    let f = build_fixture(&tree, &db, ct).await?;

    let (x, y) = tokio::join!(
        tree.add_child_at(&db, &f.root, ct("X"), Position::At(0)),
        tree.add_child_at(&db, &f.root, ct("Y"), Position::At(0)),
    );
    x?;
    y?;

    let order = order_of(&db, &f.root).await?;
    let indices: Vec<i32> = order.iter().map(|(_, index)| *index).collect();
    assert_eq!(indices, [0, 1, 2, 3, 4]);
    let names: Vec<&str> = order.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(sorted(names), ["A", "B", "C", "X", "Y"]);
    assert_eq!(tree.size(&db, &f.root).await?, 11);
    Ok(())
}
