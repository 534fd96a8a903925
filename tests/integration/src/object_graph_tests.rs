//! Object Graph Tests - copies of arbitrary graphs survive a round trip
//!
//! Random graphs with sharing and cycles are sent by copy to `echo:`,
//! which sends them straight back. The returned graph must be isomorphic
//! to the original.

mod common;

use common::*;
use distobj::{Argument, ObjectCopy, ObjectHandle};
use do_coder::{ClassRef, NodeId, ObjectGraph, Value};

const CLASSES: [&str; 3] = ["Node", "Leaf", "Branch"];

fn random_graph(rng: &mut XorShift, size: usize) -> (ObjectGraph, NodeId) {
    let mut graph = ObjectGraph::new();
    let ids: Vec<NodeId> = (0..size)
        .map(|_| {
            let class = CLASSES[rng.below(CLASSES.len() as u64) as usize];
            graph.add_object(
                ClassRef::new(class),
                vec![
                    Value::Int(rng.below(1000) as i32),
                    Value::Object(None),
                    Value::Object(None),
                ],
            )
        })
        .collect();

    for id in &ids {
        let left = (rng.below(4) != 0).then(|| ids[rng.below(size as u64) as usize]);
        let right = (rng.below(4) != 0).then(|| ids[rng.below(size as u64) as usize]);
        let node = graph.object_mut(*id).unwrap();
        node.fields[1] = Value::Object(left);
        node.fields[2] = Value::Object(right);
    }
    (graph, ids[0])
}

async fn echo_graph(seed: u64, size: usize) {
    let (_client, _server, proxy) = connected(bench(0)).await;
    let mut rng = XorShift::new(seed);
    let (graph, root) = random_graph(&mut rng, size);
    let original = ObjectCopy::new(graph, root).unwrap();

    let echoed = proxy
        .forward("echo:", vec![Argument::object(ObjectHandle::Copy(original.clone()))])
        .await
        .unwrap();
    let copy = echoed.handle().and_then(ObjectHandle::as_copy).unwrap();
    assert!(copy.is_isomorphic(&original), "seed {} size {}", seed, size);
    assert_eq!(copy.class_name(), original.class_name());
}

#[tokio::test]
async fn test_small_random_graphs() {
    for seed in 1..=20 {
        echo_graph(seed, 1 + (seed as usize % 6)).await;
    }
}

#[tokio::test]
async fn test_large_random_graph() {
    echo_graph(0x5eed, 300).await;
}

#[tokio::test]
async fn test_self_cycle() {
    let (_client, _server, proxy) = connected(bench(0)).await;
    let mut graph = ObjectGraph::new();
    let node = graph.add_object(ClassRef::new("Ouroboros"), vec![Value::Object(None)]);
    graph.object_mut(node).unwrap().fields[0] = Value::Object(Some(node));
    let original = ObjectCopy::new(graph, node).unwrap();

    let class = proxy
        .forward("className:", vec![Argument::object(ObjectHandle::Copy(original.clone()))])
        .await
        .unwrap();
    assert_eq!(class.as_str(), Some("Ouroboros"));

    let echoed = proxy
        .forward("echo:", vec![Argument::object(ObjectHandle::Copy(original.clone()))])
        .await
        .unwrap();
    let copy = echoed.handle().and_then(ObjectHandle::as_copy).unwrap();
    assert!(copy.is_isomorphic(&original));
    assert_eq!(copy.node().unwrap().fields[0], Value::Object(Some(copy.root())));
}

#[tokio::test]
async fn test_different_graphs_are_not_isomorphic() {
    let mut rng = XorShift::new(7);
    let (a, a_root) = random_graph(&mut rng, 12);
    let mut b = ObjectGraph::new();
    let b_root = b.add_object(ClassRef::new("Other"), vec![]);
    let a = ObjectCopy::new(a, a_root).unwrap();
    let b = ObjectCopy::new(b, b_root).unwrap();
    assert!(!a.is_isomorphic(&b));
}
