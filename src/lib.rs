pub mod apachelog;
pub mod arequest;
pub mod aresponse;
pub mod cmpfilemeta;
pub mod config;
pub mod easy_fs;
pub mod handler;
pub mod hostrouter;
pub mod http_request_method;
pub mod http_response_status_codes;
pub mod in_threadpool;
pub mod miniarcswap;
pub mod processor;
pub mod proxy;
pub mod random_util;
pub mod rouille_runner;
pub mod script;
pub mod site;
pub mod template;
pub mod time_util;
pub mod url_encoding;
pub mod util;
pub mod warn;
pub mod webutils;
