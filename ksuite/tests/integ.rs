#![cfg(feature = "integ")]
/*!

Starts real clusters. Requires docker and k3d (`KSUITE_K3D_PATH` if k3d is not on `$PATH`).

!*/

use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::api::ListParams;
use kube::Api;
use ksuite::{start_cluster, stop_cluster, KubeSuite, StartOptions, StopOptions};

#[tokio::test]
async fn start_and_stop() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cluster = start_cluster(StartOptions::default()).await.unwrap();
    let client = cluster.client().unwrap();
    let nodes = Api::<Node>::all(client)
        .list(&ListParams::default())
        .await
        .unwrap();
    assert_eq!(nodes.items.len(), 1);
    stop_cluster(&cluster, StopOptions::default()).await.unwrap();
}

#[tokio::test]
async fn suite() {
    let _ = env_logger::builder().is_test(true).try_init();
    KubeSuite::new(StartOptions::default(), StopOptions::default())
        .unwrap()
        .run(|cluster| async move {
            let namespaces = Api::<Namespace>::all(cluster.client().unwrap())
                .list(&ListParams::default())
                .await
                .unwrap();
            assert!(namespaces
                .items
                .iter()
                .any(|ns| ns.metadata.name.as_deref() == Some("kube-system")));
        })
        .await;
}
