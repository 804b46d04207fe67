use kube::CustomResourceExt as _;
use mysql_cluster::api::v1alpha1::{
    backup::Backup, backupschedule::BackupSchedule, cluster::Cluster, restore::Restore,
};

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Cluster::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Backup::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&BackupSchedule::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Restore::crd())?);
    Ok(())
}
