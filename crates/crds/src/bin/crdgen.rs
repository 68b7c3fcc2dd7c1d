//! Prints the CustomResourceDefinitions for every provisioning kind as a
//! multi-document YAML stream, ready for `kubectl apply -f -`.

use crds::{Bootstrap, Configuration, ConfigurationApply, Kubeconfig, Secrets};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let definitions = [
        Secrets::crd(),
        Configuration::crd(),
        ConfigurationApply::crd(),
        Bootstrap::crd(),
        Kubeconfig::crd(),
    ];

    let mut out = String::new();
    for crd in &definitions {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(crd)?);
    }
    print!("{out}");
    Ok(())
}
