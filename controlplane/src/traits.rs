use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

use crate::crds::NamespaceClassBindingStatus;

pub trait HasConditions {
    fn get_conditions_mut(&mut self) -> &mut Vec<metav1::Condition>;
}

impl HasConditions for NamespaceClassBindingStatus {
    fn get_conditions_mut(&mut self) -> &mut Vec<metav1::Condition> {
        &mut self.conditions
    }
}
