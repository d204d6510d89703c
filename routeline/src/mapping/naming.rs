use crate::handler::HandlerMethod;
use crate::router::info::RequestMappingInfo;

/// Assigns a name to a handler method mapping so it can be looked up by name.
pub trait NamingStrategy<T>: Send + Sync {
    fn name(&self, handler_method: &HandlerMethod, mapping: &T) -> String;
}

impl<T, F> NamingStrategy<T> for F
where
    F: Fn(&HandlerMethod, &T) -> String + Send + Sync,
{
    fn name(&self, handler_method: &HandlerMethod, mapping: &T) -> String {
        self(handler_method, mapping)
    }
}

/// Uses the mapping's explicit name, or the capital letters of the controller's
/// simple type name followed by `#` and the method name (`UserController::list`
/// becomes `UC#list`).
pub struct DefaultNamingStrategy;

pub const SEPARATOR: char = '#';

impl NamingStrategy<RequestMappingInfo> for DefaultNamingStrategy {
    fn name(&self, handler_method: &HandlerMethod, mapping: &RequestMappingInfo) -> String {
        if let Some(name) = mapping.name() {
            return name.to_string();
        }
        let initials: String = handler_method
            .short_type_name()
            .chars()
            .filter(char::is_ascii_uppercase)
            .collect();
        format!("{}{}{}", initials, SEPARATOR, handler_method.method().name())
    }
}
