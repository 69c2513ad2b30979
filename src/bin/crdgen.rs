// Prints the CustomResourceDefinitions for the operator's types.
// Run with: cargo run --bin crdgen > deploy/crds.yaml

use kube::CustomResourceExt;

use knative_lambda_operator::models::{LambdaAgent, LambdaFunction};

fn main() {
    let crds = [
        serde_yaml::to_string(&LambdaFunction::crd()).expect("serialize LambdaFunction CRD"),
        serde_yaml::to_string(&LambdaAgent::crd()).expect("serialize LambdaAgent CRD"),
    ];
    println!("{}", crds.join("---\n"));
}
