//! Print the operator's CRD manifests as YAML for `kubectl apply -f -`.

use kube::CustomResourceExt;

use aiops_operator::crd::{Nginx, Remediation, Rollout};

fn main() -> anyhow::Result<()> {
    let crds = [Remediation::crd(), Rollout::crd(), Nginx::crd()];

    for (i, crd) in crds.iter().enumerate() {
        if i > 0 {
            println!("---");
        }
        print!("{}", serde_yaml::to_string(crd)?);
    }

    Ok(())
}
